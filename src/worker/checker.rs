//! Checker capability
//!
//! A checker turns one value into a textual verdict. `Registry` resolves a
//! `CheckerRef` either to one of the built-in checkers or to an external
//! program invoked once per value.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::CheckerRef;

/// Locator naming the checkers compiled into this binary.
pub const BUILTIN_LOCATOR: &str = "builtin";

/// Checker errors
#[derive(Error, Debug)]
pub enum CheckerError {
    #[error("Unknown builtin checker: {0}")]
    UnknownBuiltin(String),

    #[error("Checker program not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

pub type CheckerResult<T> = Result<T, CheckerError>;

/// Produces a verdict for a single value.
pub trait Checker: Send + Sync {
    fn check(&self, value: i64) -> CheckerResult<String>;
}

/// Turns a checker reference into something callable.
pub trait CheckerResolver: Send + Sync {
    fn resolve(&self, reference: &CheckerRef) -> CheckerResult<Arc<dyn Checker>>;
}

/// Built-ins plus external programs
#[derive(Debug, Default, Clone)]
pub struct Registry;

impl Registry {
    pub fn new() -> Self {
        Self
    }

    pub fn builtin_names() -> &'static [&'static str] {
        &["collatz", "prime", "factors", "sleep"]
    }
}

impl CheckerResolver for Registry {
    fn resolve(&self, reference: &CheckerRef) -> CheckerResult<Arc<dyn Checker>> {
        if reference.locator == BUILTIN_LOCATOR {
            return match reference.name.as_str() {
                "collatz" => Ok(Arc::new(Collatz)),
                "prime" => Ok(Arc::new(Prime)),
                "factors" => Ok(Arc::new(Factors)),
                "sleep" => Ok(Arc::new(Sleep(Duration::from_secs(1)))),
                other => Err(CheckerError::UnknownBuiltin(other.to_string())),
            };
        }
        let checker = ProcessChecker::locate(Path::new(&reference.locator), &reference.name)?;
        Ok(Arc::new(checker))
    }
}

/// Number of steps for the Collatz sequence to reach 1.
#[derive(Debug, Clone, Copy)]
pub struct Collatz;

impl Checker for Collatz {
    fn check(&self, value: i64) -> CheckerResult<String> {
        if value < 1 {
            return Err(CheckerError::Failed(format!(
                "{} never reaches 1",
                value
            )));
        }
        let mut n = value as u128;
        let mut steps = 0u64;
        while n != 1 {
            n = if n % 2 == 0 { n / 2 } else { 3 * n + 1 };
            steps += 1;
        }
        Ok(format!("{} reaches 1 in {} steps", value, steps))
    }
}

/// Primality by trial division.
#[derive(Debug, Clone, Copy)]
pub struct Prime;

impl Checker for Prime {
    fn check(&self, value: i64) -> CheckerResult<String> {
        let verdict = if is_prime(value) { "prime" } else { "not prime" };
        Ok(format!("{} is {}", value, verdict))
    }
}

fn is_prime(value: i64) -> bool {
    if value < 2 {
        return false;
    }
    let mut d = 2i64;
    while d.saturating_mul(d) <= value {
        if value % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

/// Prime factorization.
#[derive(Debug, Clone, Copy)]
pub struct Factors;

impl Checker for Factors {
    fn check(&self, value: i64) -> CheckerResult<String> {
        if value < 2 {
            return Ok(format!("{} has no prime factors", value));
        }
        let mut factors = Vec::new();
        let mut n = value;
        let mut d = 2i64;
        while d.saturating_mul(d) <= n {
            while n % d == 0 {
                factors.push(d.to_string());
                n /= d;
            }
            d += 1;
        }
        if n > 1 {
            factors.push(n.to_string());
        }
        Ok(format!("{} = {}", value, factors.join(" x ")))
    }
}

/// Sleeps before answering; handy to see deadlines fire.
#[derive(Debug, Clone, Copy)]
pub struct Sleep(pub Duration);

impl Checker for Sleep {
    fn check(&self, value: i64) -> CheckerResult<String> {
        std::thread::sleep(self.0);
        Ok(format!("{} slept {:?}", value, self.0))
    }
}

/// Runs `<program> <name> <value>` and reads the verdict from stdout.
#[derive(Debug, Clone)]
pub struct ProcessChecker {
    program: PathBuf,
    name: String,
}

impl ProcessChecker {
    pub fn locate(program: &Path, name: &str) -> CheckerResult<Self> {
        if !program.is_file() {
            return Err(CheckerError::NotFound(program.to_path_buf()));
        }
        Ok(Self {
            program: program.to_path_buf(),
            name: name.to_string(),
        })
    }
}

impl Checker for ProcessChecker {
    fn check(&self, value: i64) -> CheckerResult<String> {
        let output = Command::new(&self.program)
            .arg(&self.name)
            .arg(value.to_string())
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CheckerError::Failed(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
