use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::domain::{CacheStats, CachedEdge, EdgeDirection, LinkedNode, NewEdge, SyncRecord, SyncSource};
use crate::error::NmdcError;
use crate::extract::{ExtractionSource, extract_edges};

const MEMORY_PATH: &str = ":memory:";

const UPSERT_EDGE_SQL: &str = r#"
    INSERT INTO links (source_id, target_id, relationship_type, source_type, target_type, cached_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT(source_id, target_id, relationship_type) DO UPDATE SET
        source_type = excluded.source_type,
        target_type = excluded.target_type,
        cached_at = excluded.cached_at
"#;

/// Local SQLite store of relationship edges between NMDC entities.
///
/// Only edges are kept, never entity payloads. Writes go through one
/// connection behind a mutex, so a cache can be shared between threads.
pub struct LinkCache {
    conn: Mutex<Connection>,
    path: Option<Utf8PathBuf>,
}

impl LinkCache {
    /// Opens (creating if needed) the cache file at `path`, including missing
    /// parent directories.
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self, NmdcError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    NmdcError::Store(format!("failed to create {parent}: {err}"))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;
        info!(path = %path, "link cache initialized");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn in_memory() -> Result<Self, NmdcError> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> &str {
        self.path.as_ref().map(|path| path.as_str()).unwrap_or(MEMORY_PATH)
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, NmdcError> {
        self.conn
            .lock()
            .map_err(|_| NmdcError::Store("link cache connection lock poisoned".to_string()))
    }

    /// Inserts an edge, or refreshes the types and timestamp of an existing one.
    pub fn upsert_edge(&self, edge: &NewEdge) -> Result<(), NmdcError> {
        let conn = self.connection()?;
        conn.execute(
            UPSERT_EDGE_SQL,
            params![
                edge.source_id,
                edge.target_id,
                edge.relationship_type,
                edge.source_type,
                edge.target_type,
                now_timestamp()
            ],
        )?;
        debug!(
            source = %edge.source_id,
            target = %edge.target_id,
            relationship = %edge.relationship_type,
            "upserted link"
        );
        Ok(())
    }

    /// Upserts all edges in one transaction. Either every edge lands or none does.
    pub fn upsert_edges_bulk(&self, edges: &[NewEdge]) -> Result<usize, NmdcError> {
        if edges.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let cached_at = now_timestamp();
        {
            let mut stmt = tx.prepare_cached(UPSERT_EDGE_SQL)?;
            for edge in edges {
                stmt.execute(params![
                    edge.source_id,
                    edge.target_id,
                    edge.relationship_type,
                    edge.source_type,
                    edge.target_type,
                    cached_at
                ])?;
            }
        }
        tx.commit()?;
        info!(count = edges.len(), "added links to cache");
        Ok(edges.len())
    }

    pub fn query_edges(
        &self,
        entity_id: &str,
        direction: EdgeDirection,
        relationship_type: Option<&str>,
    ) -> Result<Vec<CachedEdge>, NmdcError> {
        let side = match direction {
            EdgeDirection::Outgoing => "source_id = ?1",
            EdgeDirection::Incoming => "target_id = ?1",
            EdgeDirection::Both => "(source_id = ?1 OR target_id = ?1)",
        };
        let sql = format!(
            "SELECT source_id, target_id, relationship_type, source_type, target_type, cached_at
             FROM links
             WHERE {side} AND (?2 IS NULL OR relationship_type = ?2)
             ORDER BY source_id ASC, target_id ASC, relationship_type ASC"
        );

        let conn = self.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![entity_id, relationship_type], edge_from_row)?;
        let edges = rows.collect::<Result<Vec<_>, _>>()?;
        debug!(entity = entity_id, count = edges.len(), "found cached links");
        Ok(edges)
    }

    /// Ids on the other end of `entity_id`'s edges.
    ///
    /// `target_type` filters on the type recorded for the other endpoint; an
    /// endpoint whose type was never recorded does not match a filter.
    pub fn connected_ids(
        &self,
        entity_id: &str,
        direction: EdgeDirection,
        relationship_type: Option<&str>,
        target_type: Option<&str>,
    ) -> Result<BTreeSet<String>, NmdcError> {
        let edges = self.query_edges(entity_id, direction, relationship_type)?;
        let mut connected = BTreeSet::new();
        for edge in edges {
            let (other_id, other_type) = if edge.source_id == entity_id {
                (edge.target_id, edge.target_type)
            } else {
                (edge.source_id, edge.source_type)
            };
            let matches = match target_type {
                None => true,
                Some(wanted) => other_type.as_deref() == Some(wanted),
            };
            if matches {
                connected.insert(other_id);
            }
        }
        Ok(connected)
    }

    /// Upserts the sync row for `entity_id`. A `None` entity type keeps the
    /// type stored by an earlier sync.
    pub fn record_sync(
        &self,
        entity_id: &str,
        entity_type: Option<&str>,
        link_count: u64,
        source: SyncSource,
    ) -> Result<(), NmdcError> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO cache_metadata (entity_id, entity_type, last_synced, link_count, sync_source)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(entity_id) DO UPDATE SET
                entity_type = COALESCE(excluded.entity_type, cache_metadata.entity_type),
                last_synced = excluded.last_synced,
                link_count = excluded.link_count,
                sync_source = excluded.sync_source
            "#,
            params![
                entity_id,
                entity_type,
                now_timestamp(),
                link_count as i64,
                source.as_str()
            ],
        )?;
        Ok(())
    }

    pub fn sync_record(&self, entity_id: &str) -> Result<Option<SyncRecord>, NmdcError> {
        let conn = self.connection()?;
        let row = conn
            .query_row(
                "SELECT entity_id, entity_type, last_synced, link_count, sync_source
                 FROM cache_metadata WHERE entity_id = ?1",
                params![entity_id],
                |row| {
                    let source: String = row.get(4)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        timestamp_column(row, 2)?,
                        row.get::<_, i64>(3)?,
                        source,
                    ))
                },
            )
            .optional()?;

        row.map(|(entity_id, entity_type, last_synced, link_count, source)| {
            Ok(SyncRecord {
                entity_id,
                entity_type,
                last_synced,
                link_count: link_count.max(0) as u64,
                sync_source: source.parse()?,
            })
        })
        .transpose()
    }

    pub fn stats(&self) -> Result<CacheStats, NmdcError> {
        let conn = self.connection()?;
        let total_edges: i64 = conn.query_row("SELECT COUNT(*) FROM links", [], |row| row.get(0))?;
        let total_synced: i64 =
            conn.query_row("SELECT COUNT(*) FROM cache_metadata", [], |row| row.get(0))?;

        let mut counts_by_relationship_type = BTreeMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT relationship_type, COUNT(*) FROM links GROUP BY relationship_type",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (relationship, count) = row?;
                counts_by_relationship_type.insert(relationship, count.max(0) as u64);
            }
        }

        let (oldest, newest): (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(last_synced), MAX(last_synced) FROM cache_metadata",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(CacheStats {
            total_edges: total_edges.max(0) as u64,
            total_synced_entities: total_synced.max(0) as u64,
            counts_by_relationship_type,
            oldest_sync: oldest.as_deref().map(parse_timestamp).transpose()?,
            newest_sync: newest.as_deref().map(parse_timestamp).transpose()?,
            cache_path: self.path().to_string(),
        })
    }

    /// Removes every edge touching `entity_id` plus its sync row, or the whole
    /// cache when no id is given. Returns the number of edges removed.
    pub fn evict(&self, entity_id: Option<&str>) -> Result<usize, NmdcError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let removed = match entity_id {
            Some(entity_id) => {
                let removed = tx.execute(
                    "DELETE FROM links WHERE source_id = ?1 OR target_id = ?1",
                    params![entity_id],
                )?;
                tx.execute(
                    "DELETE FROM cache_metadata WHERE entity_id = ?1",
                    params![entity_id],
                )?;
                info!(entity = entity_id, removed, "cleared cache for entity");
                removed
            }
            None => {
                let removed = tx.execute("DELETE FROM links", [])?;
                tx.execute("DELETE FROM cache_metadata", [])?;
                info!(removed, "cleared entire link cache");
                removed
            }
        };
        tx.commit()?;
        Ok(removed)
    }

    /// Extracts edges from `source`, upserts them and records one sync row for
    /// the entity. Returns the number of distinct `(source, target, relationship)`
    /// triples, which is also the recorded link count; an edge repeated across
    /// pages counts once.
    pub fn cache_links(&self, source: &ExtractionSource) -> Result<usize, NmdcError> {
        let Some(extraction) = extract_edges(source) else {
            debug!("record has no id, nothing cached");
            return Ok(0);
        };
        let distinct = extraction
            .edges
            .iter()
            .map(|edge| {
                (
                    edge.source_id.as_str(),
                    edge.target_id.as_str(),
                    edge.relationship_type.as_str(),
                )
            })
            .collect::<BTreeSet<_>>()
            .len();
        self.upsert_edges_bulk(&extraction.edges)?;
        self.record_sync(
            &extraction.entity_id,
            extraction.entity_type.as_deref(),
            distinct as u64,
            extraction.source,
        )?;
        Ok(distinct)
    }

    pub fn cache_from_linked_instances(
        &self,
        nodes: &[LinkedNode],
        nexus_id: &str,
    ) -> Result<usize, NmdcError> {
        self.cache_links(&ExtractionSource::TraversalResult {
            nexus_id: nexus_id.to_string(),
            nodes: nodes.to_vec(),
        })
    }

    pub fn cache_from_collection_record(
        &self,
        record: &Map<String, Value>,
    ) -> Result<usize, NmdcError> {
        self.cache_links(&ExtractionSource::CollectionRecord(record.clone()))
    }
}

fn run_migrations(conn: &Connection) -> Result<(), NmdcError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS links (
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relationship_type TEXT NOT NULL,
            source_type TEXT,
            target_type TEXT,
            cached_at TEXT NOT NULL,
            PRIMARY KEY (source_id, target_id, relationship_type)
        );

        CREATE INDEX IF NOT EXISTS idx_links_source ON links(source_id);
        CREATE INDEX IF NOT EXISTS idx_links_target ON links(target_id);
        CREATE INDEX IF NOT EXISTS idx_links_rel_type ON links(relationship_type);

        CREATE TABLE IF NOT EXISTS cache_metadata (
            entity_id TEXT PRIMARY KEY,
            entity_type TEXT,
            last_synced TEXT NOT NULL,
            link_count INTEGER NOT NULL,
            sync_source TEXT NOT NULL,
            notes TEXT
        );
        "#,
    )?;
    Ok(())
}

fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<CachedEdge> {
    Ok(CachedEdge {
        source_id: row.get(0)?,
        target_id: row.get(1)?,
        relationship_type: row.get(2)?,
        source_type: row.get(3)?,
        target_type: row.get(4)?,
        cached_at: timestamp_column(row, 5)?,
    })
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, NmdcError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| NmdcError::Store(format!("invalid timestamp '{raw}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_refreshes_types_in_place() {
        let cache = LinkCache::in_memory().unwrap();
        cache
            .upsert_edge(&NewEdge::new("a", "b", "part_of"))
            .unwrap();
        cache
            .upsert_edge(&NewEdge::new("a", "b", "part_of").target_type("nmdc:Study"))
            .unwrap();

        let edges = cache.query_edges("a", EdgeDirection::Outgoing, None).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target_type.as_deref(), Some("nmdc:Study"));
    }

    #[test]
    fn timestamps_are_fixed_width_utc() {
        let stamp = now_timestamp();
        assert!(stamp.ends_with('Z'));
        assert_eq!(stamp.len(), "2024-01-01T00:00:00.000000Z".len());
    }

    #[test]
    fn in_memory_path_label() {
        let cache = LinkCache::in_memory().unwrap();
        assert_eq!(cache.path(), ":memory:");
        assert_eq!(cache.stats().unwrap().cache_path, ":memory:");
    }
}
