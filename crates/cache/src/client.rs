//! Redis-backed record store, so an assignment outlives the process that
//! wrote it and is shared by every node serving the same visitor.

use abtrack_core::error::{AbTrackError, AbTrackResult};
use abtrack_core::store::RecordStore;
use parking_lot::Mutex;
use redis::Commands;
use tracing::{debug, info};

const SECONDS_PER_DAY: u64 = 86_400;

pub struct RedisStore {
    conn: Mutex<redis::Connection>,
}

impl RedisStore {
    pub fn connect(url: &str) -> AbTrackResult<Self> {
        info!(url = %url, "Connecting to Redis");

        let client = redis::Client::open(url).map_err(store_err)?;
        let mut conn = client.get_connection().map_err(store_err)?;

        // Verify connectivity
        let pong: String = redis::cmd("PING").query(&mut conn).map_err(store_err)?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl RecordStore for RedisStore {
    fn get(&self, key: &str) -> AbTrackResult<Option<String>> {
        let value: Option<String> = self.conn.lock().get(key).map_err(store_err)?;
        match value {
            Some(v) => {
                metrics::counter!("abtrack.store.hit").increment(1);
                Ok(Some(v))
            }
            None => {
                metrics::counter!("abtrack.store.miss").increment(1);
                debug!(key = key, "Record store miss");
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: &str, ttl_days: u32) -> AbTrackResult<()> {
        let mut conn = self.conn.lock();
        if ttl_days == 0 {
            conn.del::<_, ()>(key).map_err(store_err)?;
            return Ok(());
        }
        conn.set_ex::<_, _, ()>(key, value, u64::from(ttl_days) * SECONDS_PER_DAY)
            .map_err(store_err)
    }

    fn delete(&self, key: &str) -> AbTrackResult<()> {
        self.conn.lock().del::<_, ()>(key).map_err(store_err)
    }
}

fn store_err(e: redis::RedisError) -> AbTrackError {
    AbTrackError::Store(e.to_string())
}
