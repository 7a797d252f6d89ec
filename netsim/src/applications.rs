//! User-level applications used to exercise the simulator.

mod capture;
pub use capture::Capture;

mod counter;
pub use counter::Counter;

mod ping_pong;
pub use ping_pong::{Ball, PingPong};

mod send_message;
pub use send_message::SendMessage;
