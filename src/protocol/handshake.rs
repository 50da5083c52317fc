use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::packet::{capabilities::*, *};

/// MySQL initial handshake packet (server -> client), protocol version 10
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    /// Full auth plugin data (salt), at least 20 bytes
    pub auth_plugin_data: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    pub fn new(
        connection_id: u32,
        salt: &[u8],
        auth_plugin_name: &str,
        server_version: &str,
        capability_flags: u32,
    ) -> Self {
        Self {
            protocol_version: 10,
            server_version: server_version.to_string(),
            connection_id,
            capability_flags,
            character_set: 0xFF, // utf8mb4_0900_ai_ci
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_data: salt.to_vec(),
            auth_plugin_name: auth_plugin_name.to_string(),
        }
    }

    /// Encode to a packet payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);

        // Server version (null-terminated)
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);

        buf.put_u32_le(self.connection_id);

        // Auth plugin data part 1 (8 bytes)
        buf.extend_from_slice(&self.auth_plugin_data[..8]);

        // Filler
        buf.put_u8(0);

        // Capability flags (lower 2 bytes)
        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);

        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);

        // Capability flags (upper 2 bytes)
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);

        // Auth plugin data length
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_u8((self.auth_plugin_data.len() + 1) as u8);
        } else {
            buf.put_u8(0);
        }

        // Reserved (10 bytes)
        buf.extend_from_slice(&[0u8; 10]);

        // Auth plugin data part 2
        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.extend_from_slice(&self.auth_plugin_data[8..]);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        buf.freeze()
    }

    /// Parse from a packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let protocol_version = buf.get_u8();

        // Server version (null-terminated string)
        let null_pos = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let connection_id = buf.get_u32_le();

        let mut auth_plugin_data = Vec::with_capacity(20);
        auth_plugin_data.extend_from_slice(&buf[..8]);
        buf.advance(8);

        // Filler
        buf.advance(1);

        let capability_flags_lower = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let capability_flags_upper = buf.get_u16_le() as u32;
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let auth_plugin_data_len = buf.get_u8();

        // Reserved
        buf.advance(10);

        // Auth plugin data part 2
        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = std::cmp::max(13, auth_plugin_data_len.saturating_sub(8) as usize);
            if buf.len() < len {
                return None;
            }
            let data_len = buf.iter().take(len).position(|&b| b == 0).unwrap_or(len);
            auth_plugin_data.extend_from_slice(&buf[..data_len]);
            buf.advance(len);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            AUTH_NATIVE_PASSWORD.to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data,
            auth_plugin_name,
        })
    }
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone, Default)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
    pub attrs: HashMap<String, String>,
}

impl HandshakeResponse {
    /// Parse from a packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();

        // Reserved (23 bytes)
        buf.advance(23);

        // Username (null-terminated)
        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        // Auth response
        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            let (data, consumed) = parse_length_encoded_string(buf)?;
            let data = data.to_vec();
            buf.advance(consumed);
            data
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = buf.get_u8() as usize;
            if buf.len() < len {
                return None;
            }
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else {
            // Null-terminated
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let data = buf[..null_pos].to_vec();
            buf.advance((null_pos + 1).min(buf.len()));
            data
        };

        // Database
        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let db = String::from_utf8_lossy(&buf[..null_pos]).to_string();
            buf.advance((null_pos + 1).min(buf.len()));
            if db.is_empty() {
                None
            } else {
                Some(db)
            }
        } else {
            None
        };

        // Auth plugin name
        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let name = String::from_utf8_lossy(&buf[..null_pos]).to_string();
            buf.advance((null_pos + 1).min(buf.len()));
            name
        } else {
            AUTH_NATIVE_PASSWORD.to_string()
        };

        // Connection attributes
        let mut attrs = HashMap::new();
        if capability_flags & CLIENT_CONNECT_ATTRS != 0 && !buf.is_empty() {
            if let Some((total, consumed)) = parse_length_encoded_int(buf) {
                buf.advance(consumed);
                let mut kv = &buf[..(total as usize).min(buf.len())];
                while !kv.is_empty() {
                    let Some((key, n)) = parse_length_encoded_string(kv) else {
                        break;
                    };
                    let key = String::from_utf8_lossy(key).to_string();
                    kv = &kv[n..];
                    let Some((val, n)) = parse_length_encoded_string(kv) else {
                        break;
                    };
                    attrs.insert(key, String::from_utf8_lossy(val).to_string());
                    kv = &kv[n..];
                }
            }
        }

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
            attrs,
        })
    }

    /// Encode to a packet payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);

        // Reserved (23 bytes)
        buf.extend_from_slice(&[0u8; 23]);

        // Username
        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        // Auth response
        if self.capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            encode_length_encoded_string(&mut buf, &self.auth_response);
        } else if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        // Database
        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        // Auth plugin name
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        // Connection attributes
        if self.capability_flags & CLIENT_CONNECT_ATTRS != 0 {
            let mut kv = BytesMut::new();
            for (key, val) in &self.attrs {
                encode_length_encoded_string(&mut kv, key.as_bytes());
                encode_length_encoded_string(&mut kv, val.as_bytes());
            }
            encode_length_encoded_int(&mut buf, kv.len() as u64);
            buf.extend_from_slice(&kv);
        }

        buf.freeze()
    }
}

/// Build an AuthSwitchRequest payload
pub fn build_auth_switch_request(auth_plugin_name: &str, salt: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(AUTH_SWITCH_HEADER);
    buf.extend_from_slice(auth_plugin_name.as_bytes());
    buf.put_u8(0);
    buf.extend_from_slice(salt);
    buf.put_u8(0);
    buf.freeze()
}

/// OK packet
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub header: u8,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn new(status_flags: u16, header: u8) -> Self {
        Self {
            header,
            affected_rows: 0,
            last_insert_id: 0,
            status_flags,
            warnings: 0,
        }
    }

    pub fn encode(&self, capabilities: u32) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u8(self.header);
        encode_length_encoded_int(&mut buf, self.affected_rows);
        encode_length_encoded_int(&mut buf, self.last_insert_id);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }

        buf.freeze()
    }

    /// Parse from a packet payload; accepts both 0x00 and 0xFE headers
    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        if payload.is_empty() {
            return None;
        }
        let header = payload[0];
        let mut buf = &payload[1..];

        let (affected_rows, n) = parse_length_encoded_int(buf)?;
        buf = &buf[n..];
        let (last_insert_id, n) = parse_length_encoded_int(buf)?;
        buf = &buf[n..];

        let (status_flags, warnings) = if capabilities & CLIENT_PROTOCOL_41 != 0 && buf.len() >= 4
        {
            let status = u16::from_le_bytes([buf[0], buf[1]]);
            let warnings = u16::from_le_bytes([buf[2], buf[3]]);
            (status, warnings)
        } else {
            (0, 0)
        };

        Some(Self {
            header,
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
        })
    }
}

/// ERR packet
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    pub fn encode(&self, capabilities: u32) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u8(ERR_HEADER);
        buf.put_u16_le(self.error_code);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }

        buf.extend_from_slice(self.error_message.as_bytes());

        buf.freeze()
    }

    /// Parse from a packet payload
    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        if payload.is_empty() || payload[0] != ERR_HEADER {
            return None;
        }

        let mut buf = &payload[1..];
        if buf.len() < 2 {
            return None;
        }

        let error_code = buf.get_u16_le();

        let (sql_state, error_message) =
            if capabilities & CLIENT_PROTOCOL_41 != 0 && !buf.is_empty() && buf[0] == b'#' {
                buf.advance(1);
                if buf.len() >= 5 {
                    let sql_state = String::from_utf8_lossy(&buf[..5]).to_string();
                    buf.advance(5);
                    let error_message = String::from_utf8_lossy(buf).to_string();
                    (sql_state, error_message)
                } else {
                    ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
                }
            } else {
                ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
            };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// Build an EOF packet payload
pub fn build_eof_packet(status_flags: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(EOF_HEADER);
    buf.put_u16_le(0); // warnings
    buf.put_u16_le(status_flags);
    buf.freeze()
}

/// Check if packet is an OK packet
pub fn is_ok_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == OK_HEADER
}

/// Check if packet is an ERR packet
pub fn is_err_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == ERR_HEADER
}

/// Check if packet is an EOF packet (pre-CLIENT_DEPRECATE_EOF encoding)
pub fn is_eof_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == EOF_HEADER && payload.len() <= 5
}

/// Check if packet is the OK packet that terminates a result set when
/// CLIENT_DEPRECATE_EOF is negotiated (OK with an EOF header)
pub fn is_result_set_ok_packet(payload: &[u8]) -> bool {
    // The header is 0xFE but the packet is too long for a legacy EOF and too
    // short to be a row whose first field spills past the chunk limit.
    !payload.is_empty()
        && payload[0] == EOF_HEADER
        && payload.len() >= 7
        && payload.len() < 0xFF_FFFF
}

/// Extract server status flags from an EOF packet
pub fn eof_status(payload: &[u8]) -> u16 {
    if payload.len() >= 5 {
        u16::from_le_bytes([payload[3], payload[4]])
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_salt() -> Vec<u8> {
        (1u8..=20).collect()
    }

    #[test]
    fn test_initial_handshake_roundtrip() {
        let hs = InitialHandshake::new(
            42,
            &test_salt(),
            AUTH_NATIVE_PASSWORD,
            "8.0.11-hermes",
            DEFAULT_CAPABILITIES,
        );
        let payload = hs.encode();
        let parsed = InitialHandshake::parse(&payload).unwrap();

        assert_eq!(parsed.protocol_version, 10);
        assert_eq!(parsed.server_version, "8.0.11-hermes");
        assert_eq!(parsed.connection_id, 42);
        assert_eq!(parsed.capability_flags, DEFAULT_CAPABILITIES);
        assert_eq!(parsed.auth_plugin_data, test_salt());
        assert_eq!(parsed.auth_plugin_name, AUTH_NATIVE_PASSWORD);
    }

    #[test]
    fn test_handshake_response_roundtrip() {
        let mut attrs = HashMap::new();
        attrs.insert("_client_name".to_string(), "libmysql".to_string());
        attrs.insert("_os".to_string(), "Linux".to_string());

        let resp = HandshakeResponse {
            capability_flags: DEFAULT_CAPABILITIES,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0xFF,
            username: "app_user".to_string(),
            auth_response: vec![0xAA; 20],
            database: Some("orders".to_string()),
            auth_plugin_name: AUTH_CACHING_SHA2_PASSWORD.to_string(),
            attrs,
        };

        let payload = resp.encode();
        let parsed = HandshakeResponse::parse(&payload).unwrap();

        assert_eq!(parsed.username, "app_user");
        assert_eq!(parsed.auth_response, vec![0xAA; 20]);
        assert_eq!(parsed.database.as_deref(), Some("orders"));
        assert_eq!(parsed.auth_plugin_name, AUTH_CACHING_SHA2_PASSWORD);
        assert_eq!(parsed.attrs.len(), 2);
        assert_eq!(parsed.attrs["_client_name"], "libmysql");
    }

    #[test]
    fn test_handshake_response_without_db() {
        let resp = HandshakeResponse {
            capability_flags: DEFAULT_CAPABILITIES & !CLIENT_CONNECT_WITH_DB,
            max_packet_size: 1 << 24,
            character_set: 0x21,
            username: "root".to_string(),
            auth_response: vec![],
            database: None,
            auth_plugin_name: AUTH_NATIVE_PASSWORD.to_string(),
            attrs: HashMap::new(),
        };
        let parsed = HandshakeResponse::parse(&resp.encode()).unwrap();
        assert_eq!(parsed.username, "root");
        assert!(parsed.database.is_none());
        assert!(parsed.auth_response.is_empty());
    }

    #[test]
    fn test_ok_packet_roundtrip() {
        let ok = OkPacket::new(status::SERVER_STATUS_IN_TRANS, OK_HEADER);
        let payload = ok.encode(DEFAULT_CAPABILITIES);
        assert!(is_ok_packet(&payload));

        let parsed = OkPacket::parse(&payload, DEFAULT_CAPABILITIES).unwrap();
        assert_eq!(parsed.status_flags, status::SERVER_STATUS_IN_TRANS);
    }

    #[test]
    fn test_err_packet_roundtrip() {
        let err = ErrPacket::new(1045, "28000", "Access denied");
        let payload = err.encode(DEFAULT_CAPABILITIES);
        assert!(is_err_packet(&payload));

        let parsed = ErrPacket::parse(&payload, DEFAULT_CAPABILITIES).unwrap();
        assert_eq!(parsed.error_code, 1045);
        assert_eq!(parsed.sql_state, "28000");
        assert_eq!(parsed.error_message, "Access denied");
    }

    #[test]
    fn test_eof_classification() {
        let eof = build_eof_packet(status::SERVER_MORE_RESULTS_EXISTS);
        assert!(is_eof_packet(&eof));
        assert!(!is_result_set_ok_packet(&eof));
        assert_eq!(eof_status(&eof), status::SERVER_MORE_RESULTS_EXISTS);

        // OK-with-EOF-header terminator is longer than a legacy EOF
        let ok = OkPacket::new(0, EOF_HEADER).encode(DEFAULT_CAPABILITIES);
        assert!(is_result_set_ok_packet(&ok) || ok.len() <= 5);
    }

    #[test]
    fn test_auth_switch_request() {
        let pkt = build_auth_switch_request(AUTH_CACHING_SHA2_PASSWORD, &test_salt());
        assert_eq!(pkt[0], AUTH_SWITCH_HEADER);
        let name_end = 1 + AUTH_CACHING_SHA2_PASSWORD.len();
        assert_eq!(&pkt[1..name_end], AUTH_CACHING_SHA2_PASSWORD.as_bytes());
        assert_eq!(pkt[name_end], 0);
    }
}
