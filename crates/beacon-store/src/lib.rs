pub mod error;
pub mod paths;
pub mod schema;
pub mod settings;
pub mod store;

pub use error::{Result, StoreError};
pub use paths::{
    DATA_DIR_ENV, config_path, database_path, default_base_dir, ensure_base_dir, resolve_base_dir,
};
pub use settings::{load_config, render_config};
pub use store::{FailureOutcome, Store};
