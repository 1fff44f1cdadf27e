mod common;

mod api_tests;
mod postgres_tests;
mod render_tests;
mod retry_tests;
mod suppression_tests;
