//! Packed RPC wire structures. All little-endian.

/// Leads every `RPC_CMD` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub request_id: u32,
    pub command_id: u16,
}

impl RequestHeader {
    pub const WIRE_LEN: usize = 6;

    pub fn to_wire(self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&self.request_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.command_id.to_le_bytes());
        out
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        let bytes = payload.get(..Self::WIRE_LEN)?;
        Some(Self {
            request_id: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            command_id: u16::from_le_bytes(bytes[4..6].try_into().ok()?),
        })
    }
}

/// Leads every `RPC_RSP` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub request_id: u32,
    pub command_id: u16,
    /// Negative values follow the errno convention.
    pub return_code: i16,
}

impl ResponseHeader {
    pub const WIRE_LEN: usize = 8;

    pub fn to_wire(self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&self.request_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.command_id.to_le_bytes());
        out[6..8].copy_from_slice(&self.return_code.to_le_bytes());
        out
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        let bytes = payload.get(..Self::WIRE_LEN)?;
        Some(Self {
            request_id: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            command_id: u16::from_le_bytes(bytes[4..6].try_into().ok()?),
            return_code: i16::from_le_bytes(bytes[6..8].try_into().ok()?),
        })
    }
}

/// Leads every `RPC_DATA` fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub request_id: u32,
    pub offset: u32,
}

impl DataHeader {
    pub const WIRE_LEN: usize = 8;

    pub fn to_wire(self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&self.request_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        let bytes = payload.get(..Self::WIRE_LEN)?;
        Some(Self {
            request_id: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            offset: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
        })
    }
}

/// `RPC_DATA_ACK` payload: the device acknowledges receipt up to `offset`.
pub type DataAck = DataHeader;

/// Bulk-transfer announcement following the request header.
///
/// Data-send declares the payload size and how many fragments the sender
/// transmits between ACKs; data-receive declares `size = u32::MAX` ("send me
/// everything, I don't know how much").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataParams {
    pub size: u32,
    pub rx_ack_period: u8,
}

impl DataParams {
    pub const WIRE_LEN: usize = 5;

    /// Size value declaring an unknown expected size.
    pub const SIZE_UNKNOWN: u32 = u32::MAX;

    pub fn to_wire(self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        out[4] = self.rx_ack_period;
        out
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        let bytes = payload.get(..Self::WIRE_LEN)?;
        Some(Self {
            size: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            rx_ack_period: bytes[4],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_round_trip() {
        let request = RequestHeader {
            request_id: 0xDEAD_BEEF,
            command_id: 30_000,
        };
        assert_eq!(RequestHeader::parse(&request.to_wire()), Some(request));

        let response = ResponseHeader {
            request_id: 1,
            command_id: 50,
            return_code: -22,
        };
        assert_eq!(ResponseHeader::parse(&response.to_wire()), Some(response));

        let data = DataHeader {
            request_id: 7,
            offset: 4096,
        };
        assert_eq!(DataHeader::parse(&data.to_wire()), Some(data));

        let params = DataParams {
            size: 100_000,
            rx_ack_period: 8,
        };
        assert_eq!(DataParams::parse(&params.to_wire()), Some(params));
    }

    #[test]
    fn short_payloads_fail_parse() {
        assert_eq!(RequestHeader::parse(&[0; 5]), None);
        assert_eq!(ResponseHeader::parse(&[0; 7]), None);
        assert_eq!(DataHeader::parse(&[0; 7]), None);
        assert_eq!(DataParams::parse(&[0; 4]), None);
    }

    #[test]
    fn layouts_are_little_endian_packed() {
        let response = ResponseHeader {
            request_id: 0x0403_0201,
            command_id: 0x0605,
            return_code: -1,
        };
        assert_eq!(response.to_wire(), [1, 2, 3, 4, 5, 6, 0xFF, 0xFF]);
    }
}
