//! Destination side of the proxy: addressing, dialing, HTTP forwarding
//! and the byte relay shared by both front-ends.

mod activity;
mod dial;
mod forward;
mod relay;
mod target;

pub use activity::BoxError;
pub use dial::{Connection, DialError, Dialer, DirectDialer};
pub use forward::{forward_request, into_origin_form, request_target, strip_hop_by_hop, ForwardError};
pub use relay::{is_disconnect, ConnectionRelay, Leg, RelayError, RelaySummary, Teardown};
pub use target::TargetAddr;
