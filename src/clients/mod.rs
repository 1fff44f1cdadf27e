pub mod circuit_breaker;
pub mod database;
pub mod health;
pub mod mailgun;
pub mod memory;
pub mod rbmq;
pub mod redis;
pub mod twilio;
