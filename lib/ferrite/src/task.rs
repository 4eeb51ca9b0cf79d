//! The unit of work passed from a session to the worker pool and back.

use crate::codes::{IoOpCode, IoStatus};
use crate::ConnKey;

/// Credentials captured at AUTH time. The password field is a fixed-size
/// digest; it never leaves the broker except inside authz request headers.
#[derive(Clone, Eq, PartialEq)]
pub struct UserAuth {
    pub username: String,
    pub passwd: [u8; UserAuth::PASSWD_SIZE],
}

impl UserAuth {
    pub const PASSWD_SIZE: usize = 32;

    pub fn new(username: impl Into<String>, passwd: [u8; UserAuth::PASSWD_SIZE]) -> UserAuth {
        UserAuth {
            username: username.into(),
            passwd,
        }
    }
}

impl std::fmt::Debug for UserAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // Never log the password digest.
        f.debug_struct("UserAuth")
            .field("username", &self.username)
            .finish()
    }
}

/// A request or completion moving between a `Session` and a `Worker`.
///
/// Requests are built by the session; the worker fills `status`,
/// `data_size`, `obj_size`, `merge_id` and echoes its own `worker_id`
/// before resolving the task future.
#[derive(Debug, Clone)]
pub struct Task {
    pub user: UserAuth,
    pub path: String,
    pub op: IoOpCode,
    /// Absolute address of the shared-memory slice for this chunk.
    pub data_addr: u64,
    /// Capacity of the slice (requests) or bytes transferred (replies).
    pub data_size: u32,
    pub tran_id: u32,
    /// 0 requests random routing; the pool rewrites it with the chosen id.
    pub worker_id: u32,
    /// Bytes remaining for the object after this completion.
    pub obj_size: u64,
    /// Surviving operation id for merged writes, 0 otherwise.
    pub merge_id: u32,
    pub status: IoStatus,
    pub conn_key: ConnKey,
}

impl Task {
    pub fn request(
        user: UserAuth,
        path: impl Into<String>,
        op: IoOpCode,
        data_addr: u64,
        data_size: u32,
        tran_id: u32,
        conn_key: ConnKey,
    ) -> Task {
        Task {
            user,
            path: path.into(),
            op,
            data_addr,
            data_size,
            tran_id,
            worker_id: 0,
            obj_size: 0,
            merge_id: 0,
            status: IoStatus::ErrInternal,
            conn_key,
        }
    }

    /// Completion carrying only a status, reusing the request's identity.
    pub fn reply(mut self, status: IoStatus) -> Task {
        self.status = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let user = UserAuth::new("alice", [b'x'; 32]);
        let task = Task::request(user, "/a", IoOpCode::Read, 64, 128, 7, 3);

        assert_eq!(task.worker_id, 0);
        assert_eq!(task.merge_id, 0);
        assert_eq!(task.status, IoStatus::ErrInternal);
        assert_eq!(task.conn_key, 3);
    }

    #[test]
    fn test_debug_hides_passwd() {
        let user = UserAuth::new("alice", [7u8; 32]);
        let shown = format!("{:?}", user);

        assert!(shown.contains("alice"));
        assert!(!shown.contains('7'));
    }
}
