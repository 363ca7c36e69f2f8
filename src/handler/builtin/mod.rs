//! Handlers that ship with the bridge

pub mod relay;
pub mod uptime;

pub use relay::RelayHandler;
pub use uptime::UptimeHandler;

use super::{Handler, HandlerError};
use crate::config::HandlersSection;
use std::sync::Arc;
use std::time::Duration;

/// Names accepted in `[handlers] enabled`
pub const BUILTIN_HANDLERS: &[&str] = &[relay::IDENTIFIER, uptime::IDENTIFIER];

/// Build a built-in handler by name
pub fn create(name: &str, section: &HandlersSection) -> Result<Arc<dyn Handler>, HandlerError> {
    match name {
        relay::IDENTIFIER => Ok(Arc::new(RelayHandler::new(&section.relay)?)),
        uptime::IDENTIFIER => {
            if section.uptime.interval_secs == 0 {
                return Err(HandlerError::InvalidConfig(
                    "uptime interval_secs must be greater than zero".to_string(),
                ));
            }
            Ok(Arc::new(UptimeHandler::new(Duration::from_secs(
                section.uptime.interval_secs,
            ))))
        }
        other => Err(HandlerError::UnknownHandler(other.to_string())),
    }
}

/// Names to load: the configured list, or every built-in when it is empty
pub fn enabled_names(section: &HandlersSection) -> Vec<String> {
    if section.enabled.is_empty() {
        BUILTIN_HANDLERS.iter().map(|name| name.to_string()).collect()
    } else {
        section.enabled.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_handlers() {
        let section = HandlersSection::default();
        for name in BUILTIN_HANDLERS {
            let handler = create(name, &section).unwrap();
            assert_eq!(handler.identifier(), *name);
        }
    }

    #[test]
    fn test_unknown_handler() {
        let result = create("screensaver", &HandlersSection::default());
        assert!(matches!(result, Err(HandlerError::UnknownHandler(name)) if name == "screensaver"));
    }

    #[test]
    fn test_zero_uptime_interval_rejected() {
        let mut section = HandlersSection::default();
        section.uptime.interval_secs = 0;
        assert!(matches!(
            create("uptime", &section),
            Err(HandlerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_enabled_names_defaults_to_all() {
        let mut section = HandlersSection::default();
        assert_eq!(enabled_names(&section), vec!["relay", "uptime"]);

        section.enabled = vec!["uptime".to_string()];
        assert_eq!(enabled_names(&section), vec!["uptime"]);
    }
}
