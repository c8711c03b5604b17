//! Package-install helpers shared by the manager and the in-sandbox agent.

use once_cell::sync::Lazy;
use regex::Regex;

/// PEP 508-shaped package specifier: name, optional extras, optional
/// version constraint. Anything else is rejected before it reaches a shell.
static PACKAGE_SPEC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[A-Za-z0-9][A-Za-z0-9._-]*(?:\[[A-Za-z0-9,._-]+\])?(?:[<>=!~]+[A-Za-z0-9.*,<>=!~]+)?$",
    )
    .expect("package spec regex")
});

/// Validate a package list, returning the first offending specifier.
pub fn validate_packages(packages: &[String]) -> Result<(), String> {
    if packages.is_empty() {
        return Err("no packages given".to_string());
    }
    for pkg in packages {
        if !PACKAGE_SPEC.is_match(pkg) {
            return Err(format!("invalid package specifier: {pkg}"));
        }
    }
    Ok(())
}

/// Build the shell command installing the given (validated) packages.
pub fn install_command(packages: &[String]) -> String {
    let quoted: Vec<String> = packages.iter().map(|p| format!("'{p}'")).collect();
    format!("pip install --user {}", quoted.join(" "))
}

/// Both of these must be in a session's allowlist before pip install is
/// dispatched; rejecting early beats a confusing mid-download 403.
pub const PIP_HOSTS: &[&str] = &["pypi.org", "files.pythonhosted.org"];

pub fn pip_hosts_allowed(allowed_hosts: &[String]) -> bool {
    PIP_HOSTS
        .iter()
        .all(|required| allowed_hosts.iter().any(|h| h == required))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkgs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn accepts_plain_names_extras_and_pins() {
        assert!(validate_packages(&pkgs(&["requests"])).is_ok());
        assert!(validate_packages(&pkgs(&["uvicorn[standard]"])).is_ok());
        assert!(validate_packages(&pkgs(&["numpy>=1.24,<2.0"])).is_ok());
        assert!(validate_packages(&pkgs(&["ruamel.yaml", "typing_extensions"])).is_ok());
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for bad in ["requests; rm -rf /", "$(curl evil)", "a b", "-e.", "`id`"] {
            assert!(
                validate_packages(&pkgs(&[bad])).is_err(),
                "accepted {bad:?}"
            );
        }
        assert!(validate_packages(&[]).is_err());
    }

    #[test]
    fn install_command_quotes_each_package() {
        let cmd = install_command(&pkgs(&["requests", "numpy>=1.24"]));
        assert_eq!(cmd, "pip install --user 'requests' 'numpy>=1.24'");
    }

    #[test]
    fn pip_gating_requires_both_hosts() {
        let full = pkgs(&["pypi.org", "files.pythonhosted.org", "github.com"]);
        assert!(pip_hosts_allowed(&full));
        let partial = pkgs(&["pypi.org"]);
        assert!(!pip_hosts_allowed(&partial));
        assert!(!pip_hosts_allowed(&[]));
    }
}
