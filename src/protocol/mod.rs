mod handshake;
mod packet;
mod packetio;
mod proxy_protocol;

pub use handshake::{
    build_auth_switch_request, build_eof_packet, eof_status, is_eof_packet, is_err_packet,
    is_ok_packet, is_result_set_ok_packet, ErrPacket, HandshakeResponse, InitialHandshake,
    OkPacket,
};
pub use packet::{
    capabilities, encode_length_encoded_int, encode_length_encoded_string,
    parse_length_encoded_int, parse_length_encoded_string, status, Command,
    AUTH_CACHING_SHA2_PASSWORD, AUTH_NATIVE_PASSWORD, AUTH_SESSION_TOKEN, AUTH_SWITCH_HEADER,
    EOF_HEADER, ERR_HEADER, FULL_AUTH, LOCAL_IN_FILE_HEADER, MAX_PAYLOAD_LEN, OK_HEADER,
    PACKET_HEADER_SIZE, SHA_COMMAND,
};
pub use packetio::{PacketIO, ProtocolError};
pub use proxy_protocol::{read_proxy_header, ProxyHeaderError};
