//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `serve`    | `Serve`          |
//! | `generate` | `Generate`       |
//! | `config`   | `Config`         |

pub mod config;
pub mod generate;
pub mod serve;

pub use config::cmd_config;
pub use generate::cmd_generate;
pub use serve::cmd_serve;
