//! Layering behaviour for configuration sources.

use std::ffi::{OsStr, OsString};
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use ortho_config::OrthoConfig;
use pgshare_config::Config;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

struct EnvOverride {
    key: &'static str,
    previous: Option<OsString>,
    guard: Option<MutexGuard<'static, ()>>,
}

impl EnvOverride {
    fn set_var(key: &'static str, value: &OsStr) -> Self {
        let guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        let previous = std::env::var_os(key);
        // Environment mutation is unsafe on edition 2024; the mutex keeps
        // tests in this binary from observing each other's overrides.
        unsafe { std::env::set_var(key, value) };
        Self {
            key,
            previous,
            guard: Some(guard),
        }
    }
}

impl Drop for EnvOverride {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => unsafe { std::env::set_var(self.key, value) },
            None => unsafe { std::env::remove_var(self.key) },
        }
        drop(self.guard.take());
    }
}

#[test]
fn environment_overrides_defaults() {
    let _env = EnvOverride::set_var("PGSHARE_SUPERUSER", OsStr::new("alice"));
    let config =
        Config::load_from_iter([OsString::from("pgshare")]).expect("configuration should load");
    assert_eq!(config.superuser(), "alice");
    assert!(!config.listen_tcp());
}

#[test]
fn cli_flags_override_environment() {
    let _env = EnvOverride::set_var("PGSHARE_LOCK_TIMEOUT_MS", OsStr::new("9000"));
    let args = [
        OsString::from("pgshare"),
        OsString::from("--lock-timeout-ms"),
        OsString::from("250"),
    ];
    let config = Config::load_from_iter(args).expect("configuration should load");
    assert_eq!(config.lock_timeout().as_millis(), 250);
}
