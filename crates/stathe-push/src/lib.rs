//! Push-gateway client.
//!
//! A [`Pusher`] snapshots its registry, renders the text format and sends
//! it to `<gateway>/metrics/job/<job>[/<label>/<value>...]` through a
//! [`PushTransport`]. Only one push per pusher is in flight at a time.

pub mod grouping;
pub mod pusher;
pub mod transport;

pub use grouping::Grouping;
pub use pusher::{PushState, Pusher, push_timeout};
pub use transport::{HttpTransport, PushRequest, PushTransport};
