use core::error::Error;
use std::collections::BTreeMap;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;

#[derive(Debug, derive_more::Display)]
pub enum ProfileError {
    #[display("Failed to open tuned profiles file '{}'", path.display())]
    ReadFailed { path: PathBuf },
    #[display("Failed to parse tuned profiles file '{}'", path.display())]
    ParseFailed { path: PathBuf },
    #[display("Invalid tuned profile name '{name}'")]
    InvalidName { name: String },
    #[display("Failed to create tuned profile directory '{}'", path.display())]
    CreateDirFailed { path: PathBuf },
    #[display("Failed to write tuned profile file '{}'", path.display())]
    WriteFailed { path: PathBuf },
}

impl Error for ProfileError {}

/// The mounted profile bundle: a YAML mapping of profile name to profile text.
#[derive(Debug, Clone)]
pub struct ProfileBundle {
    source: PathBuf,
    profiles_dir: PathBuf,
    file_name: String,
}

impl ProfileBundle {
    pub fn new(
        source: impl Into<PathBuf>,
        profiles_dir: impl Into<PathBuf>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            profiles_dir: profiles_dir.into(),
            file_name: file_name.into(),
        }
    }

    /// Write every profile of the bundle to `<profiles_dir>/<name>/<file_name>`.
    ///
    /// Returns the names of the extracted profiles.
    ///
    /// # Errors
    ///
    /// - [`ProfileError::ReadFailed`] / [`ProfileError::ParseFailed`] if the bundle cannot
    ///   be loaded
    /// - [`ProfileError::InvalidName`] if a profile name is not a single path component
    /// - [`ProfileError::CreateDirFailed`] / [`ProfileError::WriteFailed`] on write errors
    #[tracing::instrument(skip(self), fields(source = %self.source.display()))]
    pub fn extract(&self) -> Result<Vec<String>, Report<ProfileError>> {
        info!("Extracting tuned profiles");

        let raw = std::fs::read_to_string(&self.source).change_context(
            ProfileError::ReadFailed {
                path: self.source.clone(),
            },
        )?;
        let profiles = parse_bundle(&raw).change_context(ProfileError::ParseFailed {
            path: self.source.clone(),
        })?;

        for (name, content) in &profiles {
            self.write_profile(name, content)?;
        }

        Ok(profiles.into_keys().collect())
    }

    fn write_profile(&self, name: &str, content: &str) -> Result<(), Report<ProfileError>> {
        if !is_valid_profile_name(name) {
            return Err(Report::new(ProfileError::InvalidName {
                name: name.to_string(),
            }));
        }

        let profile_dir = self.profiles_dir.join(name);
        std::fs::create_dir_all(&profile_dir).change_context(ProfileError::CreateDirFailed {
            path: profile_dir.clone(),
        })?;

        let profile_file = profile_dir.join(&self.file_name);
        std::fs::write(&profile_file, content)
            .change_context(ProfileError::WriteFailed {
                path: profile_file.clone(),
            })?;
        debug!("Wrote profile {name} to {}", profile_file.display());
        Ok(())
    }
}

/// An empty document is an empty bundle.
fn parse_bundle(raw: &str) -> Result<BTreeMap<String, String>, serde_yaml::Error> {
    let profiles: Option<BTreeMap<String, String>> = serde_yaml::from_str(raw)?;
    Ok(profiles.unwrap_or_default())
}

fn is_valid_profile_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}
