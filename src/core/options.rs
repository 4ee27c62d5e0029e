// This module holds JIT configuration. JitOptions carries the size of the executable region
// reserved at start-up (split into an inline and an outlined half), the per-block-id version
// limit and greedy versioning switch that drive the versioning policy, flags for runtime
// counters, context verification and disassembly dumps, the safety limit on label tables and
// the batch size for eagerly compiled fall-through blocks. Options can be set field by field or
// parsed from "name=value" strings, which is how the bbjit driver and embedding hosts pass them.
// TargetArch selects which instruction encoder backend the JIT generates code for.

//! JIT configuration.

use super::error::{JitError, JitResult};

/// Target instruction set for generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    Arm64,
}

impl TargetArch {
    /// Architecture of the machine running this process.
    pub fn native() -> Self {
        if cfg!(target_arch = "aarch64") {
            TargetArch::Arm64
        } else {
            TargetArch::X86_64
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TargetArch::X86_64 => "x86-64",
            TargetArch::Arm64 => "arm64",
        }
    }
}

/// Configuration of a JIT instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitOptions {
    /// Total executable memory in bytes, inline and outlined halves together.
    pub exec_mem_size: usize,

    /// Maximum number of versions per block id.
    pub max_versions: usize,

    /// Below the version limit, compile a new version instead of reusing an imperfect match.
    pub greedy_versioning: bool,

    /// Emit runtime counter increments into generated code.
    pub gen_stats: bool,

    /// Check contexts against live frame values while compiling.
    pub verify_ctx: bool,

    /// Keep code comments and log disassembly of compiled blocks.
    pub dump_disasm: bool,

    /// Safety limit on labels and label references per code buffer.
    pub label_limit: usize,

    /// Maximum number of blocks compiled back to back by one block series.
    pub max_per_batch: usize,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            exec_mem_size: 256 * 1024 * 1024,
            max_versions: 4,
            greedy_versioning: false,
            gen_stats: false,
            verify_ctx: false,
            dump_disasm: false,
            label_limit: 32,
            max_per_batch: 64,
        }
    }
}

impl JitOptions {
    /// Apply a single `name=value` (or bare `name` for flags) option.
    ///
    /// `exec-mem-size` is given in MiB.
    pub fn parse_option(&mut self, opt: &str) -> JitResult<()> {
        let opt = opt.trim_start_matches("--");
        let (name, value) = match opt.split_once('=') {
            Some((name, value)) => (name, value),
            None => (opt, ""),
        };

        let invalid = || JitError::InvalidOption {
            name: name.to_string(),
            value: value.to_string(),
        };

        match name {
            "exec-mem-size" => {
                let mib: usize = value.parse().map_err(|_| invalid())?;
                if mib == 0 || mib > 2048 {
                    return Err(invalid());
                }
                self.exec_mem_size = mib * 1024 * 1024;
            }
            "max-versions" => {
                let n: usize = value.parse().map_err(|_| invalid())?;
                if n == 0 {
                    return Err(invalid());
                }
                self.max_versions = n;
            }
            "label-limit" => {
                self.label_limit = value.parse().map_err(|_| invalid())?;
            }
            "max-per-batch" => {
                let n: usize = value.parse().map_err(|_| invalid())?;
                if n == 0 {
                    return Err(invalid());
                }
                self.max_per_batch = n;
            }
            "greedy-versioning" => self.greedy_versioning = parse_flag(value).ok_or_else(invalid)?,
            "stats" => self.gen_stats = parse_flag(value).ok_or_else(invalid)?,
            "verify-ctx" => self.verify_ctx = parse_flag(value).ok_or_else(invalid)?,
            "dump-disasm" => self.dump_disasm = parse_flag(value).ok_or_else(invalid)?,
            _ => return Err(invalid()),
        }

        Ok(())
    }

    /// Build options from a sequence of option strings.
    pub fn from_args<I, S>(args: I) -> JitResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Self::default();
        for arg in args {
            options.parse_option(arg.as_ref())?;
        }
        Ok(options)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "" | "true" | "1" | "on" => Some(true),
        "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = JitOptions::default();
        assert_eq!(opts.max_versions, 4);
        assert_eq!(opts.exec_mem_size, 256 * 1024 * 1024);
        assert!(!opts.gen_stats);
    }

    #[test]
    fn test_parse_options() {
        let opts =
            JitOptions::from_args(["--exec-mem-size=8", "max-versions=2", "stats", "verify-ctx=0"])
                .unwrap();
        assert_eq!(opts.exec_mem_size, 8 * 1024 * 1024);
        assert_eq!(opts.max_versions, 2);
        assert!(opts.gen_stats);
        assert!(!opts.verify_ctx);
    }

    #[test]
    fn test_invalid_options() {
        let mut opts = JitOptions::default();
        assert!(opts.parse_option("max-versions=0").is_err());
        assert!(opts.parse_option("exec-mem-size=big").is_err());
        assert!(opts.parse_option("stats=maybe").is_err());
        assert!(opts.parse_option("no-such-option").is_err());
        assert_eq!(opts, JitOptions::default());
    }
}
