//! 进度回调

/// 进度接收者：`fraction` 在 0.0 到 1.0 之间
pub trait Progress {
    fn report(&self, fraction: f32, message: &str);
}

impl<F> Progress for F
where
    F: Fn(f32, &str),
{
    fn report(&self, fraction: f32, message: &str) {
        self(fraction, message)
    }
}

/// 忽略所有进度
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl Progress for NullProgress {
    fn report(&self, _fraction: f32, _message: &str) {}
}

/// 把 [0, 1] 映射到父进度的 [start, end] 区间
pub struct SubProgress<'a> {
    parent: &'a dyn Progress,
    start: f32,
    end: f32,
}

impl<'a> SubProgress<'a> {
    pub fn new(parent: &'a dyn Progress, start: f32, end: f32) -> Self {
        SubProgress { parent, start, end }
    }
}

impl Progress for SubProgress<'_> {
    fn report(&self, fraction: f32, message: &str) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.parent
            .report(self.start + (self.end - self.start) * fraction, message);
    }
}

/// 离开作用域时报告完成（包括错误提前返回）
pub struct ProgressScope<'a> {
    progress: &'a dyn Progress,
    total: usize,
}

impl<'a> ProgressScope<'a> {
    pub fn new(progress: &'a dyn Progress, total: usize) -> Self {
        progress.report(0.0, "");
        ProgressScope { progress, total }
    }

    /// 开始前不知道总数时，稍后设置
    pub fn set_total(&mut self, total: usize) {
        self.total = total;
    }

    /// 报告第 `done` 项
    pub fn step(&self, done: usize, message: &str) {
        let fraction = if self.total == 0 {
            1.0
        } else {
            done as f32 / self.total as f32
        };
        self.progress.report(fraction, message);
    }
}

impl Drop for ProgressScope<'_> {
    fn drop(&mut self) {
        self.progress.report(1.0, "");
    }
}
