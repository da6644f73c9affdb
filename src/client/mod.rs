//! Client Module
//! 
//! The peer side of the relay: a session owning one connection and the
//! presentation surface it reports inbound frames to.

pub mod presenter;
pub mod session;

pub use presenter::{ChatPresenter, ClientEvent, TerminalPresenter};
pub use session::ClientSession;
