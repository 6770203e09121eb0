//! Built-in task bodies.
//!
//! - `shell`: run a command, attach its output
//! - `build`: checkout + configure + build, attach the build log
//! - `fixme`: checkout + grep for "fixme", attach the matches

pub mod build;
pub mod fixme;
pub mod shell;
pub mod support;

pub use self::build::{BuildBody, BuildTask};
pub use self::fixme::{FixmeBody, FixmeTask};
pub use self::shell::{ShellBody, ShellTask};

use crate::app::AppBuilder;
use crate::typed::{RegistryError, Task};

/// Names of the built-in task bodies.
pub const BUILTIN_TASKS: [&str; 3] = [ShellTask::NAME, BuildTask::NAME, FixmeTask::NAME];

/// Register every built-in task body.
pub fn register_builtin(builder: AppBuilder) -> Result<AppBuilder, RegistryError> {
    builder
        .register::<ShellTask, _>(ShellBody)?
        .register::<BuildTask, _>(BuildBody)?
        .register::<FixmeTask, _>(FixmeBody)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_expected_names() {
        let app = register_builtin(AppBuilder::new())
            .unwrap()
            .expect_tasks(&BUILTIN_TASKS)
            .build()
            .unwrap();
        assert_eq!(app.registry.registered_types(), vec!["build", "fixme", "shell"]);
    }
}
