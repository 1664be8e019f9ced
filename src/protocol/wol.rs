use crate::error::{ProtocolError, Result};
use tokio::net::UdpSocket;
use tracing::debug;

const WOL_PORT: u16 = 9;
const MAGIC_PACKET_SIZE: usize = 102;

/// Parses a MAC address; accepts `:`, `-` and `.` separators and bare hex.
pub fn parse_mac(input: &str) -> std::result::Result<[u8; 6], ProtocolError> {
    let hex: String = input
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();

    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ProtocolError::InvalidMac(input.to_string()));
    }

    let mut mac = [0u8; 6];
    for (i, byte) in mac.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| ProtocolError::InvalidMac(input.to_string()))?;
    }
    Ok(mac)
}

/// 6 bytes of 0xFF followed by 16 repetitions of the MAC.
pub fn build_magic_packet(mac: [u8; 6]) -> [u8; MAGIC_PACKET_SIZE] {
    let mut packet = [0xFFu8; MAGIC_PACKET_SIZE];
    for repetition in 0..16 {
        let start = 6 + repetition * 6;
        packet[start..start + 6].copy_from_slice(&mac);
    }
    packet
}

/// Broadcasts the magic packet for `mac_str` to UDP port 9.
pub async fn wake(mac_str: &str) -> Result<()> {
    let mac = parse_mac(mac_str)?;
    let packet = build_magic_packet(mac);

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| ProtocolError::WakeFailed(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| ProtocolError::WakeFailed(e.to_string()))?;
    socket
        .send_to(&packet, ("255.255.255.255", WOL_PORT))
        .await
        .map_err(|e| ProtocolError::WakeFailed(e.to_string()))?;

    debug!(mac = mac_str, "Magic packet broadcast");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac_separators() {
        let expected = [0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22];
        assert_eq!(parse_mac("AA:BB:CC:00:11:22").expect("colon form"), expected);
        assert_eq!(parse_mac("aa-bb-cc-00-11-22").expect("dash form"), expected);
        assert_eq!(parse_mac("aabb.cc00.1122").expect("dot form"), expected);
        assert_eq!(parse_mac("aabbcc001122").expect("bare form"), expected);
    }

    #[test]
    fn test_parse_mac_rejects_invalid() {
        assert!(parse_mac("").is_err());
        assert!(parse_mac("aa:bb:cc").is_err());
        assert!(parse_mac("zz:bb:cc:00:11:22").is_err());
        assert!(parse_mac("aabbcc00112233").is_err());
    }

    #[test]
    fn test_magic_packet_layout() {
        let mac = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        let packet = build_magic_packet(mac);

        assert_eq!(packet.len(), 102);
        assert!(packet[..6].iter().all(|&b| b == 0xFF));
        for repetition in 0..16 {
            let start = 6 + repetition * 6;
            assert_eq!(&packet[start..start + 6], &mac);
        }
    }
}
