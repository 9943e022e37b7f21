//! Declaration of the worker app and the function it exposes.
//!
//! The worker runs inside the container built from [`ImageSpec`]. It serves exactly one
//! function, [`FunctionSpec::generate_image`], which the local entry point calls remotely.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "stable-diffusion-xl-example";
pub const OUTPUT_PATH: &str = "generated_image.png";
pub const COMPLETION_MESSAGE: &str = "Image generation complete!";
pub const DEFAULT_PROMPT: &str = "A majestic lion jumping from a big stone at night";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// The container image the worker executes in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSpec {
    Dockerfile(PathBuf),
}

impl ImageSpec {
    pub fn from_dockerfile<P: AsRef<Path>>(path: P) -> Self {
        Self::Dockerfile(path.as_ref().to_path_buf())
    }
}

impl fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dockerfile(path) => write!(f, "dockerfile: {}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSpec {
    pub name: String,
    pub image: ImageSpec,
}

impl AppSpec {
    pub fn new<S: ToString>(name: S, image: ImageSpec) -> Self {
        Self {
            name: name.to_string(),
            image,
        }
    }
}

impl Default for AppSpec {
    fn default() -> Self {
        Self::new(APP_NAME, ImageSpec::from_dockerfile("./Dockerfile"))
    }
}

/// A function the worker exposes for remote dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpec {
    pub name: String,
    /// Upper bound on a single call. Calls running longer are reported as timed out.
    pub timeout: Duration,
}

impl FunctionSpec {
    pub fn new<S: ToString>(name: S, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            timeout,
        }
    }

    pub fn generate_image() -> Self {
        Self::new("generate_image", DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// HTTP route the worker mounts this function on.
    pub fn route(&self) -> String {
        format!("/functions/{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_app_is_built_from_local_dockerfile() {
        let app = AppSpec::default();
        assert_eq!(app.name, "stable-diffusion-xl-example");
        assert_eq!(app.image, ImageSpec::Dockerfile(PathBuf::from("./Dockerfile")));
        assert_eq!(app.image.to_string(), "dockerfile: ./Dockerfile");
    }

    #[test]
    fn generate_image_function_has_one_hour_timeout() {
        let function = FunctionSpec::generate_image();
        assert_eq!(function.name, "generate_image");
        assert_eq!(function.timeout, Duration::from_secs(3600));
        assert_eq!(function.route(), "/functions/generate_image");
    }

    #[test]
    fn timeout_can_be_overridden() {
        let function = FunctionSpec::generate_image().with_timeout(Duration::from_secs(5));
        assert_eq!(function.timeout, Duration::from_secs(5));
        assert_eq!(function.name, "generate_image");
    }
}
