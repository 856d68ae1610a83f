pub mod event;
pub mod health;
pub mod job;
pub mod outcome;
pub mod retry;
pub mod webhook;
