//! HTTP surfaces: public cache endpoints and the administrative listener.

mod admin;
pub mod error;
mod middleware;
mod public;

pub use admin::{AdminState, build_admin_router};
pub use error::ApiError;
pub use middleware::{RequestContext, log_responses, set_request_context};
pub use public::{PublicState, build_public_router};
