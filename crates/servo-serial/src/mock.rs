//! Mock 传输（无硬件依赖）
//!
//! - 记录所有写入的字节
//! - 预置接收字节，或通过 responder 根据写入内容生成响应
//! - 注入写/刷新/读失败
//!
//! `MockTransport` 可以 clone：测试保留一个句柄，另一个交给控制器。

use crate::{SerialError, Transport};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// 根据写入的请求字节生成响应字节
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Default)]
struct MockState {
    rx: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    responder: Option<Responder>,
    fail_writes: usize,
    fail_flushes: usize,
    fail_reads: usize,
    read_chunk: Option<usize>,
    flushes: usize,
    clear_errors: usize,
    clear_backlogs: usize,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        let mock = Self::new();
        mock.set_responder(responder);
        mock
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// 预置接收字节
    pub fn queue_response(&self, bytes: &[u8]) {
        self.state.lock().rx.extend(bytes.iter().copied());
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().fail_writes = count;
    }

    pub fn fail_next_flushes(&self, count: usize) {
        self.state.lock().fail_flushes = count;
    }

    pub fn fail_next_reads(&self, count: usize) {
        self.state.lock().fail_reads = count;
    }

    /// 每次 `read` 最多返回的字节数（模拟分片到达）
    pub fn set_read_chunk(&self, chunk: usize) {
        self.state.lock().read_chunk = Some(chunk.max(1));
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().written)
    }

    pub fn pending_rx(&self) -> usize {
        self.state.lock().rx.len()
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn clear_errors_count(&self) -> usize {
        self.state.lock().clear_errors
    }

    pub fn clear_backlog_count(&self) -> usize {
        self.state.lock().clear_backlogs
    }
}

impl Transport for MockTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(SerialError::Injected("write".into()));
        }
        state.written.push(bytes.to_vec());
        if let Some(responder) = state.responder.as_mut()
            && let Some(reply) = responder(bytes)
        {
            state.rx.extend(reply);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SerialError> {
        let mut state = self.state.lock();
        if state.fail_flushes > 0 {
            state.fail_flushes -= 1;
            return Err(SerialError::Injected("flush".into()));
        }
        state.flushes += 1;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SerialError> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.fail_reads > 0 {
                state.fail_reads -= 1;
                return Err(SerialError::Injected("read".into()));
            }
            if !state.rx.is_empty() {
                let limit = state.read_chunk.unwrap_or(buf.len()).min(buf.len());
                let n = limit.min(state.rx.len());
                for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Err(SerialError::Timeout)
    }

    fn clear_errors(&mut self) -> Result<(), SerialError> {
        self.state.lock().clear_errors += 1;
        Ok(())
    }

    fn clear_read_backlog(&mut self) -> Result<(), SerialError> {
        let mut state = self.state.lock();
        state.rx.clear();
        state.clear_backlogs += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_responder_replies_to_write() {
        let mut mock =
            MockTransport::with_responder(|req| Some(req.iter().rev().copied().collect()));
        mock.write(&[1, 2, 3]).unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(mock.read(&mut buf, Duration::from_millis(1)).unwrap(), 3);
        assert_eq!(buf, [3, 2, 1]);
    }

    #[test]
    fn test_injected_failures() {
        let mut mock = MockTransport::new();
        mock.fail_next_writes(1);
        mock.fail_next_flushes(1);
        assert!(matches!(mock.write(&[1]), Err(SerialError::Injected(_))));
        assert!(mock.write(&[1]).is_ok());
        assert!(mock.flush().is_err());
        assert!(mock.flush().is_ok());
        assert_eq!(mock.written(), vec![vec![1]]);

        mock.fail_next_reads(1);
        let mut buf = [0u8; 1];
        assert!(matches!(
            mock.read(&mut buf, Duration::ZERO),
            Err(SerialError::Injected(_))
        ));
    }

    #[test]
    fn test_empty_read_times_out() {
        let mut mock = MockTransport::new();
        let mut buf = [0u8; 4];
        assert!(matches!(
            mock.read(&mut buf, Duration::from_millis(1)),
            Err(SerialError::Timeout)
        ));
    }

    #[test]
    fn test_recover_clears_backlog() {
        let mut mock = MockTransport::new();
        mock.queue_response(&[1, 2, 3]);
        mock.recover();
        assert_eq!(mock.pending_rx(), 0);
        assert_eq!(mock.clear_errors_count(), 1);
        assert_eq!(mock.clear_backlog_count(), 1);
    }
}
