pub mod memory;
pub mod redis;

use crate::placement::ChunkInfo;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;
use utilities::result::Result;

/// The six operations the external key-value collaborator must provide.
/// Anything hash-keyed with field level writes and a TTL qualifies.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn hset_bulk(&self, key: &str, fields: &[(String, String)]) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;
    async fn del(&self, key: &str) -> Result<bool>;
    async fn expire(&self, key: &str, seconds: u64) -> Result<()>;
}

/// One recorded replica of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLocation {
    pub server: String,
    pub path: String,
}

pub fn file_key(filename: &str) -> String {
    format!("file:{filename}")
}

pub fn chunk_field(chunk_id: u64) -> String {
    format!("chunk:{chunk_id}")
}

/// `server|path`. The delimiter is fixed, so a server identifier carrying
/// one is a configuration error, not something to escape around.
pub fn encode_loc(server: &str, path: &str) -> Result<String> {
    if server.contains('|') {
        return Err(format!("server identifier {server:?} contains the '|' delimiter").into());
    }
    Ok(format!("{server}|{path}"))
}

pub fn decode_loc(value: &str) -> ChunkLocation {
    match value.split_once('|') {
        Some((server, path)) => ChunkLocation {
            server: server.to_owned(),
            path: path.to_owned(),
        },
        None => ChunkLocation {
            server: value.to_owned(),
            path: String::new(),
        },
    }
}

/// Records a placement under `file:<filename>`. Later replicas of the same
/// chunk win the field, the bulk write behaves like the backing store's
/// bulk HSET.
pub async fn save_placement(
    store: &dyn MetadataStore,
    filename: &str,
    chunks: &[ChunkInfo],
    ttl_secs: u64,
) -> Result<()> {
    if chunks.is_empty() {
        return Err(format!("refusing to record an empty placement for {filename}").into());
    }
    let mut fields = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        fields.push((
            chunk_field(chunk.chunk_id),
            encode_loc(&chunk.server_ip, &chunk.file_path)?,
        ));
    }
    let key = file_key(filename);
    store.hset_bulk(&key, &fields).await?;
    if ttl_secs > 0 {
        store.expire(&key, ttl_secs).await?;
    }
    Ok(())
}

/// Reads a placement back, ordered by chunk id. Fields that are not
/// `chunk:<n>` are skipped the way the original reader skipped malformed
/// lines.
pub async fn load_placement(
    store: &dyn MetadataStore,
    filename: &str,
) -> Result<BTreeMap<u64, ChunkLocation>> {
    let all = store.hgetall(&file_key(filename)).await?;
    let mut placement = BTreeMap::new();
    for (field, value) in all {
        let Some(id_str) = field.strip_prefix("chunk:") else {
            continue;
        };
        match id_str.parse::<u64>() {
            Ok(chunk_id) => {
                placement.insert(chunk_id, decode_loc(&value));
            }
            Err(_) => {
                warn!(filename, %field, "skipping malformed chunk field");
            }
        }
    }
    Ok(placement)
}

/// Deletes a whole file entry, or one chunk field when the name uses the
/// `<filename>#chunk:<id>` form.
pub async fn delete_entry(store: &dyn MetadataStore, name: &str) -> Result<bool> {
    if let Some(pos) = name.find("#chunk:") {
        let base = &name[..pos];
        let field = &name[pos + 1..];
        store.hdel(&file_key(base), field).await
    } else {
        store.del(&file_key(name)).await
    }
}
