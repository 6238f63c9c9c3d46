#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    pub handle: u64,
    pub owner_pid: u32,
    pub title: String,
}

/// Top-level window access used for hang detection and the error-dialog
/// sweep.
pub trait WindowManager: Send + Sync {
    fn visible_windows(&self) -> Vec<WindowInfo>;

    /// True when any top-level window owned by `pid` stopped pumping messages.
    fn is_hung(&self, pid: u32) -> bool;

    fn close(&self, handle: u64);
}

/// For hosts without a desktop: there are no windows, so nothing ever hangs.
#[derive(Debug, Default)]
pub struct HeadlessWindows;

impl WindowManager for HeadlessWindows {
    fn visible_windows(&self) -> Vec<WindowInfo> {
        Vec::new()
    }

    fn is_hung(&self, _pid: u32) -> bool {
        false
    }

    fn close(&self, _handle: u64) {}
}
