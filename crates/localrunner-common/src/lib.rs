// localrunner-common: shared vocabulary for the local workflow runner.
// Depends on nothing but the ecosystem crates; used by the worker crate.

pub mod action_command;
pub mod action_result;
pub mod constants;
pub mod secret_masker;
pub mod settings;
pub mod util;

pub use action_command::ActionCommand;
pub use action_result::ActionResult;
pub use secret_masker::SecretMasker;
pub use settings::RunnerSettings;
pub use util::result_util::ResultUtil;
