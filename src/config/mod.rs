pub mod options;
pub mod settings;

pub use options::*;
pub use settings::*;
