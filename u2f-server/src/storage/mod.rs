//! Storage backends for the server
//!
//! - **PostgreSQL** (production): devices, ceremonies, users and sessions
//!   survive restarts and are shared between instances.
//! - **Memory** (development): the engine's DashMap directory. Everything is
//!   lost on restart.
//!
//! The backend is selected by `DATABASE_URL`.

mod postgres;

pub use postgres::PostgresDirectory;
