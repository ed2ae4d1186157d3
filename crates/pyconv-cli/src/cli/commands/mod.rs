pub mod convert;
pub mod detect;
mod dispatch;
pub mod info;
pub mod magic;

pub use dispatch::dispatch;
