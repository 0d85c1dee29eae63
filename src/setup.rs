//! Control request SETUP packets

use usb_device::{
    control::{Recipient, Request, RequestType},
    UsbDirection,
};

/// An 8-byte SETUP packet
///
/// Fields are decoded from the little-endian wire format. The raw bytes are
/// kept, so the packet can be handed back to hardware unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct SetupPacket {
    raw: [u8; 8],
}

impl SetupPacket {
    /// Wrap the raw bytes of a SETUP packet.
    pub const fn from_bytes(raw: [u8; 8]) -> Self {
        SetupPacket { raw }
    }

    /// Build a SETUP packet from its fields.
    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        let value = value.to_le_bytes();
        let index = index.to_le_bytes();
        let length = length.to_le_bytes();
        SetupPacket {
            raw: [
                request_type,
                request,
                value[0],
                value[1],
                index[0],
                index[1],
                length[0],
                length[1],
            ],
        }
    }

    /// The raw packet.
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.raw
    }

    /// `bmRequestType`
    pub const fn request_type_bits(&self) -> u8 {
        self.raw[0]
    }

    /// `bRequest`
    pub const fn request(&self) -> u8 {
        self.raw[1]
    }

    /// `wValue`
    pub const fn value(&self) -> u16 {
        u16::from_le_bytes([self.raw[2], self.raw[3]])
    }

    /// `wIndex`
    pub const fn index(&self) -> u16 {
        u16::from_le_bytes([self.raw[4], self.raw[5]])
    }

    /// `wLength`
    pub const fn length(&self) -> u16 {
        u16::from_le_bytes([self.raw[6], self.raw[7]])
    }

    /// Direction of the DATA stage, from `bmRequestType` bit 7.
    pub fn direction(&self) -> UsbDirection {
        if self.raw[0] & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    /// Direction of the STATUS stage.
    ///
    /// Always opposite of the DATA stage. A request without a DATA stage
    /// finishes with an IN status, whatever its direction bit says.
    pub fn status_direction(&self) -> UsbDirection {
        if self.length() == 0 || self.direction() == UsbDirection::Out {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    /// Standard, class, vendor, or reserved.
    pub fn request_type(&self) -> RequestType {
        match (self.raw[0] >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    /// Device, interface, endpoint, or other.
    pub fn recipient(&self) -> Recipient {
        match self.raw[0] & 0b1_1111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// Indicates a standard `SET_ADDRESS` request to the device.
    pub fn is_set_address(&self) -> bool {
        self.request_type() == RequestType::Standard
            && self.recipient() == Recipient::Device
            && self.request() == Request::SET_ADDRESS
    }
}

impl From<[u8; 8]> for SetupPacket {
    fn from(raw: [u8; 8]) -> Self {
        Self::from_bytes(raw)
    }
}
