pub mod call;
pub mod events;
