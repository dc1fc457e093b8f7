//! Startup diagnostics
//!
//! Run before the loop starts and by `parley check`. Nothing here is fatal;
//! each check reports what it found.

use crate::Config;
use crate::audio::MicStreamManager;
use crate::hotword::HotwordMatcher;
use crate::store::PersistenceStore;
use crate::voice::CpalPlayer;

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Working
    Ok,
    /// Usable with reduced function
    Warn,
    /// Not usable
    Fail,
}

impl CheckStatus {
    /// Short marker for terminal output
    #[must_use]
    pub const fn marker(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Fail => "FAIL",
        }
    }
}

/// One diagnostic line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    /// What was checked
    pub name: &'static str,
    /// Result
    pub status: CheckStatus,
    /// Human-readable detail
    pub detail: String,
}

impl Check {
    fn new(name: &'static str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name,
            status,
            detail: detail.into(),
        }
    }
}

/// All checks from one run
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    /// Checks in the order they ran
    pub checks: Vec<Check>,
}

impl CheckReport {
    /// Whether any check failed outright
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.checks.iter().any(|c| c.status == CheckStatus::Fail)
    }

    /// Log every check
    pub fn log(&self) {
        for check in &self.checks {
            match check.status {
                CheckStatus::Ok => tracing::info!(check = check.name, detail = %check.detail, "startup check"),
                CheckStatus::Warn => tracing::warn!(check = check.name, detail = %check.detail, "startup check"),
                CheckStatus::Fail => tracing::error!(check = check.name, detail = %check.detail, "startup check"),
            }
        }
    }
}

impl std::fmt::Display for CheckReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for check in &self.checks {
            writeln!(f, "[{:>4}] {:<12} {}", check.status.marker(), check.name, check.detail)?;
        }
        Ok(())
    }
}

/// Capture device summary
#[must_use]
pub fn check_input(mic: &MicStreamManager) -> Check {
    let devices = mic.list_devices();
    if devices.is_empty() {
        return Check::new("input", CheckStatus::Fail, "no input devices found");
    }
    if mic.is_degraded() {
        return Check::new(
            "input",
            CheckStatus::Warn,
            format!("{} device(s), but no stream could be opened", devices.len()),
        );
    }
    Check::new(
        "input",
        CheckStatus::Ok,
        format!("{} device(s): {}", devices.len(), devices.join(", ")),
    )
}

/// Playback device summary
#[must_use]
pub fn check_output() -> Check {
    let devices = CpalPlayer::list_devices();
    if devices.is_empty() {
        Check::new("output", CheckStatus::Fail, "no output devices found")
    } else {
        Check::new(
            "output",
            CheckStatus::Ok,
            format!("{} device(s): {}", devices.len(), devices.join(", ")),
        )
    }
}

/// Hotword alias summary
#[must_use]
pub fn check_hotword(hotword: &HotwordMatcher) -> Check {
    Check::new(
        "hotword",
        CheckStatus::Ok,
        format!("'{}' with {} alias(es)", hotword.word(), hotword.alias_count()),
    )
}

/// Store reachability
#[must_use]
pub fn check_store(store: &dyn PersistenceStore, enabled: bool) -> Check {
    if !enabled {
        return Check::new("store", CheckStatus::Warn, "disabled; nothing is remembered");
    }
    match store.ping() {
        Ok(()) => Check::new("store", CheckStatus::Ok, "reachable"),
        Err(e) => Check::new("store", CheckStatus::Fail, e.to_string()),
    }
}

/// Which API keys are present
#[must_use]
pub fn check_keys(config: &Config) -> Vec<Check> {
    let present = |key: bool, name: &'static str, missing: &str| {
        if key {
            Check::new(name, CheckStatus::Ok, "configured")
        } else {
            Check::new(name, CheckStatus::Warn, missing.to_string())
        }
    };
    vec![
        present(
            config.api_keys.openai.is_some(),
            "openai",
            "OPENAI_API_KEY not set; transcription unavailable",
        ),
        present(
            config.llm_key().is_some(),
            "llm",
            "no model key; only local answers are available",
        ),
    ]
}

/// Run every check that needs no hardware, plus the given input check
#[must_use]
pub fn run_checks(
    config: &Config,
    input: Option<Check>,
    hotword: &HotwordMatcher,
    store: &dyn PersistenceStore,
) -> CheckReport {
    let mut checks = vec![Check::new(
        "config",
        CheckStatus::Ok,
        config.source_display(),
    )];
    checks.extend(input);
    checks.push(check_hotword(hotword));
    checks.push(check_store(store, config.store.enabled));
    checks.extend(check_keys(config));
    CheckReport { checks }
}
