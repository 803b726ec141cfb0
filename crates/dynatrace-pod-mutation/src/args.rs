//! Command line arguments of the install container

/// `bootstrap` subcommand every install container runs
pub const BOOTSTRAP_COMMAND: &str = "bootstrap";

/// Folder inside the code-modules image that holds the agent
pub const SOURCE_FOLDER: &str = "source";
/// Folder the agent is copied into
pub const TARGET_FOLDER: &str = "target";
/// Path the agent is mounted at in user containers
pub const INSTALL_PATH: &str = "install-path";
/// Full-stack mode marker
pub const FULLSTACK: &str = "fullstack";
/// Tenant UUID in full-stack mode
pub const TENANT: &str = "tenant";
/// Single technology to keep
pub const TECHNOLOGY: &str = "technology";
/// Version to download
pub const TARGET_VERSION: &str = "target-version";
/// Technologies to download
pub const TECHNOLOGIES: &str = "technologies";
/// Code modules flavor to download
pub const FLAVOR: &str = "flavor";
/// Pod level attribute `key=value`
pub const ATTRIBUTE: &str = "attribute";
/// Container level attributes as JSON
pub const ATTRIBUTE_CONTAINER: &str = "attribute-container";

/// A named argument rendered as `--name=value`, or `--name` without a value
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arg {
    name: &'static str,
    value: String,
}

impl Arg {
    /// Argument with a value
    pub fn new(name: &'static str, value: impl Into<String>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }

    /// Argument without a value
    pub fn flag(name: &'static str) -> Self {
        Self::new(name, "")
    }

    /// Command line form
    pub fn render(&self) -> String {
        if self.value.is_empty() {
            format!("--{}", self.name)
        } else {
            format!("--{}={}", self.name, self.value)
        }
    }
}

/// Append rendered `args` to a container argument list
pub fn append(target: &mut Option<Vec<String>>, args: impl IntoIterator<Item = Arg>) {
    target
        .get_or_insert_with(Vec::new)
        .extend(args.into_iter().map(|a| a.render()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_value_and_flag_forms() {
        assert_eq!(Arg::new(TENANT, "abc").render(), "--tenant=abc");
        assert_eq!(Arg::flag(FULLSTACK).render(), "--fullstack");
        assert_eq!(Arg::new(FLAVOR, "").render(), "--flavor");
    }

    #[test]
    fn append_creates_missing_list() {
        let mut args = None;
        append(&mut args, [Arg::new(SOURCE_FOLDER, "/opt/dynatrace/oneagent")]);
        append(&mut args, [Arg::flag(FULLSTACK)]);
        assert_eq!(
            args,
            Some(vec![
                "--source=/opt/dynatrace/oneagent".to_string(),
                "--fullstack".to_string()
            ])
        );
    }
}
