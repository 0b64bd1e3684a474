pub mod routes;
pub mod session_binding;
pub mod session_dto;
pub mod session_handlers;

pub use session_binding::SessionBinding;
