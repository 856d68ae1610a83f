pub mod sms;
pub mod webhook;
