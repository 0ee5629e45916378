use std::path::PathBuf;

use log::warn;

/// Name of the kernel function the dispatch binds.
pub const DEFAULT_FUNCTION_NAME: &str = "matmul";

/// Environment variable overriding [`MatmulConfig::function_name`].
pub const ENV_FUNCTION: &str = "MM_KERNEL_FUNCTION";
/// Environment variable pointing at a precompiled kernel library.
pub const ENV_LIBRARY: &str = "MM_KERNEL_LIBRARY";
/// Environment variable fixing the threadgroup size, formatted `WxH`.
pub const ENV_THREADGROUP: &str = "MM_THREADGROUP";

/// Where the kernel library is loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KernelSource {
    /// The device's built-in library containing `matmul`.
    #[default]
    Default,
    /// Kernel source text compiled when the library is loaded.
    Source(String),
    /// A precompiled library file (`.metallib`).
    File(PathBuf),
}

/// How threadgroup dimensions are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadgroupPolicy {
    /// `(execution width, max threads / execution width, 1)`.
    #[default]
    Auto,
    /// Explicit dimensions, validated against the pipeline limits.
    Fixed { width: usize, height: usize },
}

/// Settings used once when a [`MatmulContext`](crate::MatmulContext) is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatmulConfig {
    pub kernel: KernelSource,
    pub function_name: String,
    pub threadgroup: ThreadgroupPolicy,
}

impl Default for MatmulConfig {
    fn default() -> Self {
        MatmulConfig {
            kernel: KernelSource::Default,
            function_name: DEFAULT_FUNCTION_NAME.to_string(),
            threadgroup: ThreadgroupPolicy::Auto,
        }
    }
}

impl MatmulConfig {
    pub fn with_kernel(mut self, kernel: KernelSource) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = name.into();
        self
    }

    pub fn with_threadgroup(mut self, policy: ThreadgroupPolicy) -> Self {
        self.threadgroup = policy;
        self
    }

    /// Defaults overridden by `MM_KERNEL_FUNCTION`, `MM_KERNEL_LIBRARY` and
    /// `MM_THREADGROUP`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable lookup.
    ///
    /// Malformed values are skipped with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = MatmulConfig::default();

        if let Some(name) = lookup(ENV_FUNCTION) {
            let name = name.trim();
            if name.is_empty() {
                warn!("{} is set but empty, using {:?}", ENV_FUNCTION, DEFAULT_FUNCTION_NAME);
            } else {
                config.function_name = name.to_string();
            }
        }

        if let Some(path) = lookup(ENV_LIBRARY) {
            if !path.trim().is_empty() {
                config.kernel = KernelSource::File(PathBuf::from(path.trim()));
            }
        }

        if let Some(raw) = lookup(ENV_THREADGROUP) {
            match parse_threadgroup(&raw) {
                Some(policy) => config.threadgroup = policy,
                None => warn!("ignoring malformed {}={:?}, expected WxH", ENV_THREADGROUP, raw),
            }
        }

        config
    }
}

/// Parse `WxH` (e.g. `32x8`) into a fixed threadgroup policy.
pub fn parse_threadgroup(raw: &str) -> Option<ThreadgroupPolicy> {
    let (w, h) = raw.trim().split_once(['x', 'X'])?;
    let width = w.trim().parse().ok()?;
    let height = h.trim().parse().ok()?;
    Some(ThreadgroupPolicy::Fixed { width, height })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default() {
        let c = MatmulConfig::default();
        assert_eq!(c.function_name, "matmul");
        assert_eq!(c.kernel, KernelSource::Default);
        assert_eq!(c.threadgroup, ThreadgroupPolicy::Auto);
    }

    #[test]
    fn test_builder() {
        let c = MatmulConfig::default()
            .with_function_name("matmul_f32")
            .with_threadgroup(ThreadgroupPolicy::Fixed {
                width: 32,
                height: 4,
            })
            .with_kernel(KernelSource::Source("kernel void matmul() {}".into()));
        assert_eq!(c.function_name, "matmul_f32");
        assert!(matches!(c.kernel, KernelSource::Source(_)));
    }

    #[test]
    fn test_from_lookup() {
        let c = MatmulConfig::from_lookup(lookup_from(&[
            (ENV_FUNCTION, "gemm"),
            (ENV_LIBRARY, "/tmp/kernels.metallib"),
            (ENV_THREADGROUP, "64x4"),
        ]));
        assert_eq!(c.function_name, "gemm");
        assert_eq!(c.kernel, KernelSource::File(PathBuf::from("/tmp/kernels.metallib")));
        assert_eq!(
            c.threadgroup,
            ThreadgroupPolicy::Fixed {
                width: 64,
                height: 4
            }
        );
    }

    #[test]
    fn test_from_lookup_malformed() {
        let c = MatmulConfig::from_lookup(lookup_from(&[
            (ENV_FUNCTION, "  "),
            (ENV_THREADGROUP, "sixty-four"),
        ]));
        assert_eq!(c, MatmulConfig::default());
    }

    #[test]
    fn test_parse_threadgroup() {
        assert_eq!(
            parse_threadgroup("32X8"),
            Some(ThreadgroupPolicy::Fixed {
                width: 32,
                height: 8
            })
        );
        assert_eq!(parse_threadgroup("32"), None);
        assert_eq!(parse_threadgroup("ax8"), None);
    }
}
