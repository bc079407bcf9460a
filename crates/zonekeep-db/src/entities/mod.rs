pub mod console_sessions;
