pub mod capture;
pub mod channel;
pub mod session;
