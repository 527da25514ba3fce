//! Protocols and the sessions that run them.
//!
//! The web application owns both tables; the service only resolves
//! `session → protocol → pump config`.  The write side exists for the
//! collaborator API and for tests.

use rusqlite::{OptionalExtension, params};

use crate::config::{PumpConfig, validate_pump_config};
use crate::error::{PumpError, Result};

use super::{Store, json_column, now};

impl Store {
    /// Insert or replace a protocol's pump configuration.
    pub fn upsert_protocol(&self, protocol_id: &str, name: &str, pumps: &PumpConfig) -> Result<()> {
        validate_pump_config(pumps)?;
        let json = serde_json::to_string(pumps)?;
        let ts = now();
        self.conn().execute(
            "INSERT INTO protocols (protocol_id, name, pump_config, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT (protocol_id) DO UPDATE SET
                 name = excluded.name,
                 pump_config = excluded.pump_config,
                 updated_at = excluded.updated_at",
            params![protocol_id, name, json, ts],
        )?;
        Ok(())
    }

    pub fn protocol_pump_config(&self, protocol_id: &str) -> Result<Option<PumpConfig>> {
        let conn = self.conn();
        let cfg = conn
            .query_row(
                "SELECT pump_config FROM protocols WHERE protocol_id = ?1",
                params![protocol_id],
                |row| json_column::<PumpConfig>(row, 0),
            )
            .optional()?;
        Ok(cfg)
    }

    pub fn register_session(&self, session_id: &str, protocol_id: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sessions (session_id, protocol_id, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (session_id) DO UPDATE SET protocol_id = excluded.protocol_id",
            params![session_id, protocol_id, now()],
        )?;
        Ok(())
    }

    pub fn session_protocol(&self, session_id: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let id = conn
            .query_row(
                "SELECT protocol_id FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Resolve the protocol and its pump configuration for a session.
    pub fn resolve_session(&self, session_id: &str) -> Result<(String, PumpConfig)> {
        let protocol_id = self.session_protocol(session_id)?.ok_or_else(|| {
            PumpError::Configuration(format!("session {session_id} has no protocol"))
        })?;
        let cfg = self.protocol_pump_config(&protocol_id)?.ok_or_else(|| {
            PumpError::Configuration(format!("protocol {protocol_id} has no pump configuration"))
        })?;
        Ok((protocol_id, cfg))
    }
}
