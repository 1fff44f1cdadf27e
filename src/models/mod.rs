pub mod batch;
pub mod callback;
pub mod circuit_breaker;
pub mod health;
pub mod message;
pub mod phone;
pub mod response;
pub mod retry;
pub mod status;
pub mod template;
pub mod validation;
