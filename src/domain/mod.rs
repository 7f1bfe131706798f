pub mod audit;
pub mod clock;
pub mod control;
pub mod health;

pub use audit::AuditEvent;
pub use clock::*;
pub use control::*;
pub use health::*;
