use crate::error::{Error, Result};
use std::{fs, path, process};
use zeroize::Zeroize as _;

// Keyed-section configuration file. Unknown keys are rejected: a typoed
// "imap.passwort" must not silently fall back to a prompt-less login.

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  pub user: User,
  pub imap: Imap,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct User {
  pub name: String,
  pub email: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Imap {
  pub user: String,
  password: Option<String>,
  password_cmd: Option<String>,
  pub host: String,
  pub port: u16,
  pub ssl: bool,
}

impl Config {
  pub fn load(path: &path::Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
      .map_err(|error| Error::UserIntent(format!("couldn't read {}: {error}", path.display())))?;
    let config: Config = toml::from_str(&contents)
      .map_err(|error| Error::UserIntent(format!("{}: {error}", path.display())))?;
    if config.imap.password.is_none() && config.imap.password_cmd.is_none() {
      return Err(Error::UserIntent(
        "one of imap.password or imap.password_cmd is required".to_string(),
      ));
    }
    Ok(config)
  }
}

impl Imap {
  /// The configured password, or the first line of the configured command's
  /// stdout. The command's full output is zeroized after use.
  pub fn password(&self) -> Result<String> {
    if let Some(password) = &self.password {
      return Ok(password.clone());
    }
    let command = self.password_cmd.as_ref().unwrap();
    log::info!("getting password from {command:?}");
    let output = process::Command::new("sh")
      .arg("-c")
      .arg(command)
      .output()
      .map_err(|error| Error::UserIntent(format!("couldn't run {command:?}: {error}")))?;
    if !output.status.success() {
      return Err(Error::UserIntent(format!(
        "couldn't get password: {command:?} failed"
      )));
    }
    let mut stdout = output.stdout;
    let result = match stdout.split(|byte| *byte == b'\n').next() {
      Some(line) if !line.is_empty() => match std::str::from_utf8(line) {
        Ok(password) => Ok(password.to_string()),
        Err(_) => Err(Error::UserIntent(format!(
          "{command:?} didn't output UTF-8"
        ))),
      },
      _ => Err(Error::UserIntent(format!("{command:?} didn't output anything"))),
    };
    stdout.zeroize();
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write as _;

  fn write_config(contents: &str) -> (tempfile::TempDir, path::PathBuf) {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("gristrc");
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    (directory, path)
  }

  #[test]
  fn minimal() {
    let (_directory, path) = write_config(
      "[user]
       name = \"Ada\"
       email = \"ada@example.com\"

       [imap]
       user = \"ada@example.com\"
       password = \"hunter2\"
       host = \"imap.example.com\"
       port = 993
       ssl = true",
    );
    let config = Config::load(&path).unwrap();
    assert_eq!("Ada", config.user.name);
    assert_eq!(993, config.imap.port);
    assert!(config.imap.ssl);
    assert_eq!("hunter2", config.imap.password().unwrap());
  }

  #[test]
  fn password_cmd() {
    let (_directory, path) = write_config(
      "[user]
       name = \"Ada\"
       email = \"ada@example.com\"

       [imap]
       user = \"ada\"
       password_cmd = \"echo hunter2; echo ignored\"
       host = \"localhost\"
       port = 143
       ssl = false",
    );
    let config = Config::load(&path).unwrap();
    assert_eq!("hunter2", config.imap.password().unwrap());
  }

  #[test]
  fn unknown_keys_rejected() {
    let (_directory, path) = write_config(
      "[user]
       name = \"Ada\"
       email = \"ada@example.com\"
       shoe_size = 46

       [imap]
       user = \"ada\"
       password = \"x\"
       host = \"localhost\"
       port = 143
       ssl = false",
    );
    match Config::load(&path) {
      Err(Error::UserIntent(message)) => assert!(message.contains("shoe_size")),
      other => panic!("{other:?}"),
    }
  }

  #[test]
  fn password_required() {
    let (_directory, path) = write_config(
      "[user]
       name = \"Ada\"
       email = \"ada@example.com\"

       [imap]
       user = \"ada\"
       host = \"localhost\"
       port = 143
       ssl = false",
    );
    assert!(Config::load(&path).is_err());
  }
}
