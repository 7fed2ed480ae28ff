//! Shared pool of copy buffers
//!
//! Every live TCP copy direction needs a 32 KiB scratch buffer; pooling them
//! bounds allocation pressure under many short connections.

use std::sync::{Mutex, OnceLock};

/// Size of one relay copy buffer (32 KiB)
pub const BUFFER_SIZE: usize = 32 * 1024;

const MAX_POOLED: usize = 64;

static POOL: OnceLock<Mutex<Vec<Vec<u8>>>> = OnceLock::new();

fn pool() -> &'static Mutex<Vec<Vec<u8>>> {
    POOL.get_or_init(|| Mutex::new(Vec::with_capacity(MAX_POOLED)))
}

/// Take a zeroed `BUFFER_SIZE` buffer from the pool, allocating if empty.
pub fn get_buffer() -> Vec<u8> {
    if let Some(buf) = pool().lock().unwrap().pop() {
        return buf;
    }
    vec![0u8; BUFFER_SIZE]
}

/// Return a buffer for reuse. Buffers that were shrunk or grown are dropped
/// instead of pooled.
pub fn return_buffer(mut buf: Vec<u8>) {
    if buf.capacity() < BUFFER_SIZE {
        return;
    }
    buf.clear();
    buf.resize(BUFFER_SIZE, 0);

    let mut pool = pool().lock().unwrap();
    if pool.len() < MAX_POOLED {
        pool.push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_reuse() {
        let buf = get_buffer();
        assert_eq!(buf.len(), BUFFER_SIZE);
        return_buffer(buf);

        let again = get_buffer();
        assert_eq!(again.len(), BUFFER_SIZE);
        assert!(again.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_undersized_buffer_not_pooled() {
        return_buffer(vec![0u8; 16]);
        let buf = get_buffer();
        assert_eq!(buf.len(), BUFFER_SIZE);
    }
}
