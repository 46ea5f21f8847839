//! 显示模式协商

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::team::model::DisplayMode;

/// 协商结果：请求的模式不可用时回退到 in_process 并附带警告
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayNegotiation {
    pub requested: DisplayMode,
    pub effective: DisplayMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl DisplayNegotiation {
    pub fn fell_back(&self) -> bool {
        self.requested != self.effective
    }
}

/// 根据可用性探测结果选择实际使用的模式
pub fn negotiate<F>(requested: DisplayMode, is_available: F) -> DisplayNegotiation
where
    F: Fn(DisplayMode) -> bool,
{
    if requested == DisplayMode::InProcess || is_available(requested) {
        return DisplayNegotiation {
            requested,
            effective: requested,
            warning: None,
        };
    }

    let warning = format!(
        "Display mode '{}' is not available, falling back to '{}'",
        requested,
        DisplayMode::InProcess
    );
    warn!(requested = %requested, "{}", warning);

    DisplayNegotiation {
        requested,
        effective: DisplayMode::InProcess,
        warning: Some(warning),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_mode_kept() {
        let result = negotiate(DisplayMode::Tmux, |_| true);
        assert_eq!(result.effective, DisplayMode::Tmux);
        assert!(result.warning.is_none());
        assert!(!result.fell_back());
    }

    #[test]
    fn test_unavailable_mode_falls_back() {
        let result = negotiate(DisplayMode::Process, |m| m != DisplayMode::Process);
        assert_eq!(result.effective, DisplayMode::InProcess);
        assert!(result.fell_back());
        assert!(result.warning.unwrap().contains("process"));
    }

    #[test]
    fn test_in_process_never_checked() {
        let result = negotiate(DisplayMode::InProcess, |_| false);
        assert_eq!(result.effective, DisplayMode::InProcess);
        assert!(result.warning.is_none());
    }
}
