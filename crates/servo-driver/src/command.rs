//! 命令队列
//!
//! 多生产者、单消费者的 FIFO。任何线程都可以入队；只有控制线程
//! （或循环停止时的同步清空）会出队并访问串口。
//!
//! 调用方需要等待结果时，用 `PendingCommand::with_completion` 附加一个
//! 一次性完成通道，然后在 `CompletionHandle::wait` 上带超时阻塞。
//! 超时返回后到达的响应仍会送入通道，只是没人再接收。

use crate::error::DriverError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use servo_protocol::{Packet, PacketFormat};
use std::fmt;
use std::time::Duration;

/// 响应回调：`None` 表示命令没有发送出去
pub type ResponseCallback = Box<dyn FnOnce(Option<Vec<Packet>>) + Send>;

/// 待发送的底层命令
pub struct PendingCommand {
    request: Vec<u8>,
    response_count: usize,
    response_size: usize,
    format: PacketFormat,
    callback: Option<ResponseCallback>,
}

impl PendingCommand {
    /// 不期望响应的命令
    pub fn new(request: Vec<u8>, format: PacketFormat) -> Self {
        Self {
            request,
            response_count: 0,
            response_size: 0,
            format,
            callback: None,
        }
    }

    /// 期望 `count` 个响应包，每个携带 `size` 字节数据
    pub fn expect_responses(mut self, count: usize, size: usize) -> Self {
        self.response_count = count;
        self.response_size = size;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Option<Vec<Packet>>) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// 附加一次性完成通道
    pub fn with_completion(self) -> (Self, CompletionHandle) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let command = self.on_complete(move |result| {
            // 调用方可能已超时返回，忽略发送失败
            let _ = tx.try_send(result);
        });
        (command, CompletionHandle { rx })
    }

    pub fn request(&self) -> &[u8] {
        &self.request
    }

    pub fn response_count(&self) -> usize {
        self.response_count
    }

    pub fn response_size(&self) -> usize {
        self.response_size
    }

    pub fn format(&self) -> PacketFormat {
        self.format
    }

    /// 完成命令，调用回调（如果有）
    pub fn complete(mut self, result: Option<Vec<Packet>>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCommand")
            .field("request_len", &self.request.len())
            .field("response_count", &self.response_count)
            .field("response_size", &self.response_size)
            .field("format", &self.format)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// 阻塞等待命令完成
#[derive(Debug)]
pub struct CompletionHandle {
    rx: Receiver<Option<Vec<Packet>>>,
}

impl CompletionHandle {
    /// 等待响应
    ///
    /// - 超时：`DriverError::Timeout`
    /// - 命令未发送出去：`DriverError::NoResponse`
    /// - 否则返回读到的包（可能少于预期或带错误标记，由调用方判断）
    pub fn wait(self, timeout: Duration) -> Result<Vec<Packet>, DriverError> {
        match self.rx.recv_timeout(timeout) {
            Ok(Some(packets)) => Ok(packets),
            Ok(None) => Err(DriverError::NoResponse),
            Err(RecvTimeoutError::Timeout) => Err(DriverError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(DriverError::NoResponse),
        }
    }
}

/// 命令队列
#[derive(Debug)]
pub struct CommandQueue {
    tx: Sender<PendingCommand>,
    rx: Receiver<PendingCommand>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, command: PendingCommand) {
        // 队列无界且收发两端同属本结构体，不会失败
        if let Err(TrySendError::Full(cmd) | TrySendError::Disconnected(cmd)) =
            self.tx.try_send(command)
        {
            cmd.complete(None);
        }
    }

    pub fn pop(&self) -> Option<PendingCommand> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
