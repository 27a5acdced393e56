pub mod access_request;
pub mod break_glass_event;
pub mod server_session;

pub use access_request::Entity as AccessRequest;
pub use break_glass_event::Entity as BreakGlassEvent;
pub use server_session::Entity as ServerSession;
