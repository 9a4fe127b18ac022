//! 插件可见的宿主能力
//! The host capability handed to a plugin's `initialize`.

use crate::queue::{Origin, QueueSender, WorkTicket};
use std::fmt;

/// 宿主能力句柄
/// Host capability handle
///
/// The only host reference a plugin ever receives. It can submit
/// fire-and-forget continuations to the host thread and nothing else. A
/// continuation that panics is caught and logged by the drain loop; the
/// submitter never hears about it.
#[derive(Clone)]
pub struct HostCapability {
    sender: QueueSender,
    origin: Origin,
}

impl HostCapability {
    pub fn new(sender: QueueSender, origin: impl Into<Origin>) -> Self {
        Self {
            sender,
            origin: origin.into(),
        }
    }

    /// 提交一个在宿主线程上执行的延续
    /// Submit a continuation to run on the host thread
    ///
    /// Dropped silently once the host has been disposed.
    pub fn submit<F>(&self, continuation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.submit(self.origin.clone(), move |_| {
            continuation();
            Ok(())
        });
    }

    /// Keep the host's drain loop alive until the returned ticket is dropped.
    ///
    /// Plugins that run their own background work should hold a ticket for as
    /// long as a continuation may still be submitted.
    pub fn keep_alive(&self) -> WorkTicket {
        self.sender.ticket()
    }

    pub fn origin(&self) -> &str {
        self.origin.as_str()
    }
}

impl fmt::Debug for HostCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCapability")
            .field("origin", &self.origin)
            .finish()
    }
}
