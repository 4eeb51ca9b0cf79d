//! Decodes authz reply bodies into operation handlers. A handler owns the
//! manifest — the ordered fragment list with precomputed global offsets —
//! and a cursor (`consumed`) it advances as it drives the backend client.

use crate::cluster::backend::BackendClient;
use crate::remote::message::IoResponse;
use ferrite::codes::IoStatus;
use serde_derive::Deserialize;
use std::convert::TryFrom;

/// One backend fragment of a logical object.
#[derive(Debug, Clone)]
pub struct RadosObj {
    pub pool: String,
    pub oid: String,
    /// Usable bytes in this fragment (`size - start`).
    pub cap: u64,
    /// Initial intra-fragment offset from the manifest.
    pub start: u64,
    /// Bytes already consumed within this fragment.
    pub progress: u64,
    /// Append to the object rather than write at an offset.
    pub append: bool,
    /// Offset of this fragment's first usable byte in the logical object.
    pub global: u64,
}

impl RadosObj {
    fn covers(&self, offset: u64) -> bool {
        offset >= self.global && offset < self.global + self.cap
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Result")]
    result: ResultBody,
}

#[derive(Deserialize)]
struct ResultBody {
    #[serde(rename = "Object_Size")]
    object_size: Option<u64>,
    #[serde(rename = "Rados_Objs")]
    rados_objs: Option<Vec<FragmentBody>>,
    #[serde(rename = "Data_Manifest")]
    #[allow(dead_code)]
    data_manifest: Option<serde_json::Value>,
    #[serde(rename = "Error_Type")]
    error_type: Option<u8>,
}

#[derive(Deserialize)]
struct FragmentBody {
    pool: String,
    oid: String,
    size: u64,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    new_object: u64,
}

fn remote_status(code: Option<u8>) -> IoStatus {
    match code {
        Some(code) => IoStatus::try_from(code).unwrap_or(IoStatus::ErrInternal),
        None => IoStatus::ErrInternal,
    }
}

/// Cursor over a read manifest; issues backend reads fragment by fragment.
pub struct ReadHandler {
    objs: Vec<RadosObj>,
    total: u64,
    consumed: u64,
    status: IoStatus,
}

impl ReadHandler {
    /// Build from a READ check reply. A handler always comes back; a
    /// decode problem or remote error surfaces through `status()`.
    pub fn from_response(response: &IoResponse) -> ReadHandler {
        let failed = |status| ReadHandler {
            objs: Vec::new(),
            total: 0,
            consumed: 0,
            status,
        };

        if response.status != IoStatus::Success {
            return failed(response.status);
        }

        let envelope: Envelope = match serde_json::from_slice(&response.data) {
            Ok(envelope) => envelope,
            Err(_) => return failed(IoStatus::ErrInternal),
        };

        let (total, bodies) = match (envelope.result.object_size, envelope.result.rados_objs) {
            (Some(total), Some(bodies)) if total > 0 => (total, bodies),
            _ => return failed(remote_status(envelope.result.error_type)),
        };

        let mut objs = Vec::with_capacity(bodies.len());
        let mut global = 0u64;

        for body in bodies {
            if body.size <= body.offset {
                return failed(IoStatus::ErrContent);
            }

            let cap = body.size - body.offset;
            objs.push(RadosObj {
                pool: body.pool,
                oid: body.oid,
                cap,
                start: body.offset,
                progress: 0,
                append: false,
                global,
            });
            global += cap;
        }

        // The manifest must account for exactly the declared size.
        if global != total {
            return failed(IoStatus::ErrContent);
        }

        ReadHandler {
            objs,
            total,
            consumed: 0,
            status: IoStatus::Success,
        }
    }

    pub fn status(&self) -> IoStatus {
        self.status
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }

    pub fn data_offset(&self) -> u64 {
        self.consumed
    }

    pub fn remaining(&self) -> u64 {
        self.total - self.consumed
    }

    pub fn done_reading(&self) -> bool {
        self.consumed == self.total
    }

    pub fn reset_data_offset(&mut self, offset: u64) -> bool {
        if offset > self.total {
            return false;
        }

        self.consumed = offset;
        for obj in &mut self.objs {
            obj.progress = offset.saturating_sub(obj.global).min(obj.cap);
        }
        true
    }

    /// Issue one backend read of at most `want_bytes`, bounded by the
    /// fragment covering the cursor. Returns the accepted byte count and
    /// advances the cursor; 0 means nothing was issued.
    pub fn read_data(&mut self, want_bytes: u64, backend: &mut BackendClient, user_ctx: usize) -> u64 {
        if self.done_reading() || self.status != IoStatus::Success || want_bytes == 0 {
            return 0;
        }

        let consumed = self.consumed;
        let obj = match self.objs.iter_mut().find(|obj| obj.covers(consumed)) {
            Some(obj) => obj,
            None => return 0,
        };

        let cap = want_bytes.min(obj.cap - obj.progress);
        let accepted = backend.read_object(
            &obj.pool,
            &obj.oid,
            cap,
            obj.start + obj.progress,
            user_ctx,
        );

        if accepted == 0 {
            return 0;
        }

        obj.progress += accepted;
        self.consumed += accepted;
        debug_assert!(self.consumed <= self.total);

        accepted
    }
}

/// Cursor over a write manifest; issues backend writes or appends and
/// retains the check-write reply body as the commit payload.
pub struct WriteHandler {
    objs: Vec<RadosObj>,
    total: u64,
    consumed: u64,
    status: IoStatus,
    commit_body: Option<Vec<u8>>,
}

impl WriteHandler {
    pub fn from_response(response: &IoResponse) -> WriteHandler {
        let failed = |status| WriteHandler {
            objs: Vec::new(),
            total: 0,
            consumed: 0,
            status,
            commit_body: None,
        };

        if response.status != IoStatus::Success {
            return failed(response.status);
        }

        let envelope: Envelope = match serde_json::from_slice(&response.data) {
            Ok(envelope) => envelope,
            Err(_) => return failed(IoStatus::ErrInternal),
        };

        let bodies = match envelope.result.rados_objs {
            Some(bodies) => bodies,
            None => return failed(remote_status(envelope.result.error_type)),
        };

        let mut objs = Vec::with_capacity(bodies.len());
        let mut global = 0u64;

        for body in bodies {
            if body.size <= body.offset {
                return failed(IoStatus::ErrContent);
            }

            let cap = body.size - body.offset;
            objs.push(RadosObj {
                pool: body.pool,
                oid: body.oid,
                cap,
                start: body.offset,
                progress: 0,
                // A pre-existing object gets appends; a fresh one is
                // written at explicit offsets.
                append: body.new_object == 0,
                global,
            });
            global += cap;
        }

        WriteHandler {
            objs,
            total: global,
            consumed: 0,
            status: IoStatus::Success,
            commit_body: Some(response.data.clone()),
        }
    }

    pub fn status(&self) -> IoStatus {
        self.status
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }

    pub fn data_offset(&self) -> u64 {
        self.consumed
    }

    pub fn remaining(&self) -> u64 {
        self.total - self.consumed
    }

    pub fn done_writing(&self) -> bool {
        self.consumed >= self.total
    }

    pub fn reset_data_offset(&mut self, offset: u64) -> bool {
        if offset > self.total {
            return false;
        }

        self.consumed = offset;
        for obj in &mut self.objs {
            obj.progress = offset.saturating_sub(obj.global).min(obj.cap);
        }
        true
    }

    /// The payload for the commit request, available exactly once.
    pub fn take_commit_body(&mut self) -> Option<Vec<u8>> {
        self.commit_body.take()
    }

    /// Issue one backend write from `buf`, bounded by the fragment
    /// covering the cursor. Returns the accepted byte count; 0 means
    /// nothing was issued.
    pub fn write_data(&mut self, buf: &[u8], backend: &mut BackendClient, user_ctx: usize) -> u64 {
        if self.status != IoStatus::Success || buf.is_empty() || self.done_writing() {
            return 0;
        }

        let consumed = self.consumed;
        let obj = match self.objs.iter_mut().find(|obj| obj.covers(consumed)) {
            Some(obj) => obj,
            None => return 0,
        };

        let cap = (buf.len() as u64).min(obj.cap - obj.progress);
        let accepted = backend.write_object(
            &obj.pool,
            &obj.oid,
            &buf[..cap as usize],
            obj.start + obj.progress,
            obj.append,
            user_ctx,
        );

        if accepted == 0 {
            return 0;
        }

        obj.progress += accepted;
        self.consumed += accepted;

        accepted
    }
}

/// Status-only parsing for COMMIT and DELETE replies.
pub fn parse_status(response: &IoResponse) -> IoStatus {
    if response.status != IoStatus::Success {
        return response.status;
    }

    match serde_json::from_slice::<Envelope>(&response.data) {
        Ok(envelope) => match envelope.result.error_type {
            Some(code) => IoStatus::try_from(code).unwrap_or(IoStatus::ErrInternal),
            None => IoStatus::ErrInternal,
        },
        Err(_) => IoStatus::ErrInternal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::store::MemStore;
    use ferrite::codes::IoOpCode;
    use ferrite::logging::discard_logger;
    use std::sync::Arc;

    fn response(body: &str) -> IoResponse {
        IoResponse {
            op: IoOpCode::Read,
            status: IoStatus::Success,
            data: body.as_bytes().to_vec(),
        }
    }

    fn backend(store: MemStore) -> BackendClient {
        BackendClient::new(Arc::new(store), discard_logger())
    }

    #[test]
    fn test_read_manifest_single_fragment() {
        let handler = ReadHandler::from_response(&response(
            r#"{"Result":{"Object_Size":10,"Rados_Objs":[{"pool":"p","oid":"o","size":10}]}}"#,
        ));

        assert_eq!(handler.status(), IoStatus::Success);
        assert_eq!(handler.total_size(), 10);
        assert!(!handler.done_reading());
    }

    #[test]
    fn test_read_manifest_size_mismatch_is_content_error() {
        let handler = ReadHandler::from_response(&response(
            r#"{"Result":{"Object_Size":11,"Rados_Objs":[{"pool":"p","oid":"o","size":10}]}}"#,
        ));

        assert_eq!(handler.status(), IoStatus::ErrContent);
        assert_eq!(handler.total_size(), 0);
    }

    #[test]
    fn test_read_manifest_error_type() {
        let handler = ReadHandler::from_response(&response(r#"{"Result":{"Error_Type":3}}"#));
        assert_eq!(handler.status(), IoStatus::ErrPath);
    }

    #[test]
    fn test_read_manifest_garbage() {
        let handler = ReadHandler::from_response(&response("]["));
        assert_eq!(handler.status(), IoStatus::ErrInternal);
    }

    #[test]
    fn test_read_across_fragments() {
        let store = MemStore::new(1024);
        store.put_object("p", "o1", b"abcd".to_vec());
        store.put_object("p", "o2", b"efgh".to_vec());
        let mut client = backend(store);

        let mut handler = ReadHandler::from_response(&response(
            r#"{"Result":{"Object_Size":8,"Rados_Objs":[
                {"pool":"p","oid":"o1","size":4},
                {"pool":"p","oid":"o2","size":4}]}}"#,
        ));

        // A request spanning the fragment boundary is capped at it.
        assert_eq!(handler.read_data(8, &mut client, 0), 4);
        assert_eq!(handler.data_offset(), 4);
        assert_eq!(handler.read_data(8, &mut client, 1), 4);
        assert!(handler.done_reading());
        assert_eq!(handler.read_data(8, &mut client, 2), 0);

        let mut out = Vec::new();
        client.poll_completions(&mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data, b"abcd");
        assert_eq!(out[1].data, b"efgh");
    }

    #[test]
    fn test_reset_data_offset_bounds() {
        let mut handler = ReadHandler::from_response(&response(
            r#"{"Result":{"Object_Size":10,"Rados_Objs":[{"pool":"p","oid":"o","size":10}]}}"#,
        ));

        assert!(handler.reset_data_offset(10));
        assert!(handler.done_reading());
        assert!(!handler.reset_data_offset(11));
        assert!(handler.reset_data_offset(0));
        assert_eq!(handler.remaining(), 10);
    }

    #[test]
    fn test_write_manifest_two_fragments() {
        let mut handler = WriteHandler::from_response(&response(
            r#"{"Result":{"Rados_Objs":[
                {"pool":"p","oid":"o1","size":8,"offset":0,"new_object":1},
                {"pool":"p","oid":"o2","size":4,"offset":0,"new_object":1}],
                "Data_Manifest":{}}}"#,
        ));

        assert_eq!(handler.status(), IoStatus::Success);
        assert_eq!(handler.total_size(), 12);
        assert!(handler.take_commit_body().is_some());
        assert!(handler.take_commit_body().is_none());
    }

    #[test]
    fn test_write_manifest_offset_trims_capacity() {
        let handler = WriteHandler::from_response(&response(
            r#"{"Result":{"Rados_Objs":[
                {"pool":"p","oid":"o","size":8,"offset":3,"new_object":0}]}}"#,
        ));

        assert_eq!(handler.total_size(), 5);
        assert!(handler.objs[0].append);
    }

    #[test]
    fn test_write_manifest_bad_extent() {
        let handler = WriteHandler::from_response(&response(
            r#"{"Result":{"Rados_Objs":[
                {"pool":"p","oid":"o","size":3,"offset":3,"new_object":1}]}}"#,
        ));

        assert_eq!(handler.status(), IoStatus::ErrContent);
    }

    #[test]
    fn test_write_data_lands_in_store() {
        let store = MemStore::new(1024);
        let store = Arc::new(store);
        let mut client = BackendClient::new(store.clone(), discard_logger());

        let mut handler = WriteHandler::from_response(&response(
            r#"{"Result":{"Rados_Objs":[
                {"pool":"p","oid":"o1","size":8,"offset":0,"new_object":1},
                {"pool":"p","oid":"o2","size":4,"offset":0,"new_object":1}]}}"#,
        ));

        let payload = b"0123456789ab";
        let mut offset = 0usize;
        while offset < payload.len() {
            let accepted = handler.write_data(&payload[offset..], &mut client, offset);
            assert!(accepted > 0);
            offset += accepted as usize;
        }

        assert!(handler.done_writing());
        assert_eq!(store.object("p", "o1").unwrap(), b"01234567");
        assert_eq!(store.object("p", "o2").unwrap(), b"89ab");
    }

    #[test]
    fn test_parse_status() {
        let ok = IoResponse {
            op: IoOpCode::Commit,
            status: IoStatus::Success,
            data: br#"{"Result":{"Error_Type":0}}"#.to_vec(),
        };
        assert_eq!(parse_status(&ok), IoStatus::Success);

        let denied = IoResponse {
            op: IoOpCode::Delete,
            status: IoStatus::Success,
            data: br#"{"Result":{"Error_Type":4}}"#.to_vec(),
        };
        assert_eq!(parse_status(&denied), IoStatus::ErrDeny);

        let transport = IoResponse::error(IoOpCode::Commit, IoStatus::ErrInternal);
        assert_eq!(parse_status(&transport), IoStatus::ErrInternal);
    }
}
