//! Client for the CTMS academic portal.
//!
//! CTMS is an ASP.NET WebForms site without an API. Every operation is a form
//! postback answered by a full HTML page, so this client replays the portal's
//! hidden postback tokens, scrapes the returned markup and classifies the
//! portal's failure pages.

pub mod api;
pub mod errors;
pub mod events;
pub mod json;
pub mod markup;
pub mod middleware;
pub mod models;
pub mod relay;
pub mod session;
pub mod stats;

pub use api::{AnnouncementSink, CtmsApi, Envelope, LogAnnouncements, PageRequest};
pub use errors::{CtmsError, ErrorKind, TransportFailure};
pub use events::{Event, EventKind, EventRegistry};
pub use relay::{RelayRequest, RelayResponse, RelayTransport, RequestBody, Transport};
pub use session::{Feature, PostbackContext, SessionManager};
