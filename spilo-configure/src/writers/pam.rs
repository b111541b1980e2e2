//! PAM configuration for OAuth2 authentication

use super::files::FileWriter;
use anyhow::Result;
use std::path::Path;
use tracing::{error, info};

/// PAM stanza for `PAM_OAUTH2`, `None` when absent or invalid.
///
/// The value needs at least two words, the first an `https` URL.
pub fn pam_oauth2_config(args: &str) -> Option<String> {
    let words: Vec<&str> = args.split_whitespace().collect();
    if words.len() < 2 {
        info!("No PAM_OAUTH2 configuration was specified, skipping");
        return None;
    }
    let is_https = words[0]
        .strip_prefix("https://")
        .is_some_and(|rest| !rest.is_empty());
    if !is_https {
        error!(url = words[0], "First argument of PAM_OAUTH2 must be a valid https url");
        return None;
    }
    Some(format!(
        "auth sufficient pam_oauth2.so {}\naccount sufficient pam_oauth2.so\n",
        args
    ))
}

pub fn write_pam_oauth2(args: &str, path: &Path, writer: &FileWriter) -> Result<()> {
    if let Some(config) = pam_oauth2_config(args) {
        writer.write(&config, path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_config_requires_https_and_args() {
        assert_eq!(pam_oauth2_config(""), None);
        assert_eq!(pam_oauth2_config("https://auth.example.org"), None);
        assert_eq!(pam_oauth2_config("http://auth.example.org uid"), None);
        assert_eq!(
            pam_oauth2_config("https://auth.example.org/info uid realm=/employees").as_deref(),
            Some(
                "auth sufficient pam_oauth2.so https://auth.example.org/info uid realm=/employees\n\
                 account sufficient pam_oauth2.so\n"
            )
        );
    }

    #[test]
    fn test_write_skips_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("postgresql");
        write_pam_oauth2("ftp://x y", &path, &FileWriter::unowned(false)).unwrap();
        assert!(!path.exists());
        write_pam_oauth2("https://x y", &path, &FileWriter::unowned(false)).unwrap();
        assert!(fs::read_to_string(&path).unwrap().starts_with("auth sufficient"));
    }
}
