use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags};

const REQUIRED_TABLES: [&str; 2] = ["topics", "messages"];

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("could not open bag {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{} is not a rosbag2 database, table `{table}` is missing", path.display())]
    MissingTable { path: PathBuf, table: &'static str },

    #[error("bag query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// A topic recorded in the bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
    pub type_name: String,
    pub message_count: u64,
}

/// One serialized message as stored in the bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Receive time in nanoseconds since the UNIX epoch.
    pub timestamp_ns: i64,
    pub data: Vec<u8>,
}

/// Read-only access to a rosbag2 SQLite storage file (`.db3`).
pub struct BagReader {
    conn: Connection,
    path: PathBuf,
}

impl BagReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        // without SQLITE_OPEN_CREATE a missing file is an error instead of a new empty database
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| StorageError::Open {
            path: path.clone(),
            source,
        })?;

        for table in REQUIRED_TABLES {
            // a file that is not a database at all only fails on the first query
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                    params![table],
                    |row| row.get(0),
                )
                .map_err(|source| StorageError::Open {
                    path: path.clone(),
                    source,
                })?;

            if !exists {
                return Err(StorageError::MissingTable { path, table });
            }
        }

        tracing::debug!("Opened bag {}", path.display());

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lists all recorded topics with their message count, ordered by name.
    pub fn topics(&self) -> Result<Vec<TopicInfo>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT t.name, t.type, COUNT(m.id)
             FROM topics t LEFT JOIN messages m ON m.topic_id = t.id
             GROUP BY t.id
             ORDER BY t.name",
        )?;

        let topics = stmt
            .query_map([], |row| {
                Ok(TopicInfo {
                    name: row.get(0)?,
                    type_name: row.get(1)?,
                    message_count: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(topics)
    }

    /// All messages of `topic` in ascending timestamp order. Empty if the topic does not exist.
    pub fn messages(&self, topic: &str) -> Result<Vec<RawMessage>, StorageError> {
        self.with_messages(topic, |messages| messages.collect())
    }

    /// Streams the messages of `topic` in ascending timestamp order into `f`, one row at a time.
    ///
    /// A row that cannot be read ends the stream and is reported as the error once `f` returns,
    /// so `f` has seen every message before it.
    pub fn with_messages<R>(
        &self,
        topic: &str,
        f: impl FnOnce(&mut dyn Iterator<Item = RawMessage>) -> R,
    ) -> Result<R, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT m.timestamp, m.data
             FROM messages m JOIN topics t ON m.topic_id = t.id
             WHERE t.name = ?1
             ORDER BY m.timestamp, m.id",
        )?;

        let rows = stmt.query_map(params![topic], |row| {
            Ok(RawMessage {
                timestamp_ns: row.get(0)?,
                data: row.get(1)?,
            })
        })?;

        let mut failure = None;
        let result = {
            let mut messages = rows.map_while(|row| match row {
                Ok(message) => Some(message),
                Err(e) => {
                    failure = Some(e);
                    None
                }
            });
            f(&mut messages)
        };

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(result),
        }
    }
}
