use serde::{Deserialize, Serialize};
use std::fmt;

/// 插件生命周期状态
/// Plugin lifecycle state
///
/// `Discovered -> Loaded -> Initialized -> Active -> Disposed`. Any state may
/// jump straight to `Disposed`; `Disposed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginState {
    /// 已发现（尚未打开）
    /// Discovered (not yet opened)
    Discovered,
    /// 已加载并校验入口点
    /// Library opened and entry points validated
    Loaded,
    /// 初始化成功
    /// `initialize` succeeded
    Initialized,
    /// 导出已安装
    /// Exports installed
    Active,
    /// 已释放
    /// Disposed
    Disposed,
}

impl PluginState {
    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Discovered, Loaded)
                | (Loaded, Initialized)
                | (Initialized, Active)
                | (Discovered | Loaded | Initialized | Active, Disposed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == PluginState::Disposed
    }

    /// Whether `dispose` must be called when tearing the plugin down.
    pub fn needs_dispose(self) -> bool {
        matches!(self, PluginState::Initialized | PluginState::Active)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginState::Discovered => "discovered",
            PluginState::Loaded => "loaded",
            PluginState::Initialized => "initialized",
            PluginState::Active => "active",
            PluginState::Disposed => "disposed",
        };
        f.write_str(s)
    }
}
