//! FSDEV register definitions
//!
//! The layout follows the `ral-registers` conventions, so the `read_reg!`,
//! `write_reg!`, and `modify_reg!` macros work on these blocks.
//!
//! It also adds some helpers for the endpoint registers. Their toggle and
//! clear-on-zero bits don't survive a plain read-modify-write.

#![allow(non_snake_case, non_upper_case_globals)]

pub use ral_registers::{modify_reg, read_reg, write_reg, RORegister, RWRegister};

use core::ops::Deref;

/// Number of endpoint registers.
pub const ENDPOINTS: usize = 8;

/// Size of the packet memory, in bytes.
pub const PMA_SIZE: u16 = 1024;

#[repr(C)]
pub struct RegisterBlock {
    pub EPR: [RWRegister<u32>; ENDPOINTS],
    _reserved: [u32; 8],
    pub CNTR: RWRegister<u32>,
    pub ISTR: RWRegister<u32>,
    pub FNR: RORegister<u32>,
    pub DADDR: RWRegister<u32>,
    pub BTABLE: RWRegister<u32>,
    pub LPMCSR: RWRegister<u32>,
    pub BCDR: RWRegister<u32>,
}

/// An owned pointer to the register block
pub struct Instance {
    addr: *const RegisterBlock,
}

impl Instance {
    /// # Safety
    ///
    /// `addr` must point to the FSDEV registers, and nothing else may use
    /// them while the instance exists.
    pub const unsafe fn new(addr: *const RegisterBlock) -> Self {
        Instance { addr }
    }
}

impl Deref for Instance {
    type Target = RegisterBlock;
    fn deref(&self) -> &RegisterBlock {
        // Safety: valid for the life of the instance, per `new`.
        unsafe { &*self.addr }
    }
}

macro_rules! fields {
    ($($field:ident : $offset:expr, $width:expr $(, { $($value:ident = $bits:expr),* })?;)*) => {
        $(
            #[allow(dead_code)]
            pub mod $field {
                pub const offset: u32 = $offset;
                pub const mask: u32 = ((1 << $width) - 1) << offset;
                pub mod R {}
                pub mod W {}
                pub mod RW {
                    $($(pub const $value: u32 = $bits;)*)?
                }
            }
        )*
    };
}

pub mod CNTR {
    fields! {
        CTRM: 15, 1;
        PMAOVRM: 14, 1;
        ERRM: 13, 1;
        WKUPM: 12, 1;
        SUSPM: 11, 1;
        RESETM: 10, 1;
        SOFM: 9, 1;
        ESOFM: 8, 1;
        RESUME: 4, 1;
        FSUSP: 3, 1;
        LP_MODE: 2, 1;
        PDWN: 1, 1;
        FRES: 0, 1;
    }
}

pub mod ISTR {
    fields! {
        CTR: 15, 1;
        PMAOVR: 14, 1;
        ERR: 13, 1;
        WKUP: 12, 1;
        SUSP: 11, 1;
        RESET: 10, 1;
        SOF: 9, 1;
        ESOF: 8, 1;
        DIR: 4, 1;
        EP_ID: 0, 4;
    }
}

pub mod FNR {
    fields! {
        RXDP: 15, 1;
        RXDM: 14, 1;
        LCK: 13, 1;
        LSOF: 11, 2;
        FN: 0, 11;
    }
}

pub mod DADDR {
    fields! {
        EF: 7, 1;
        ADD: 0, 7;
    }
}

pub mod BCDR {
    fields! {
        DPPU: 15, 1;
    }
}

/// The register API wants each endpoint register as its own field. This
/// wrapper, and its field module, make one array element look that way.
pub mod endpoint {
    use super::{RWRegister, RegisterBlock};

    pub struct Epr<'a> {
        pub EPR: &'a RWRegister<u32>,
    }

    pub mod EPR {
        fields! {
            CTR_RX: 15, 1;
            DTOG_RX: 14, 1;
            STAT_RX: 12, 2, { DISABLED = 0, STALL = 1, NAK = 2, VALID = 3 };
            SETUP: 11, 1;
            EP_TYPE: 9, 2, { BULK = 0, CONTROL = 1, ISO = 2, INTERRUPT = 3 };
            EP_KIND: 8, 1;
            CTR_TX: 7, 1;
            DTOG_TX: 6, 1;
            STAT_TX: 4, 2, { DISABLED = 0, STALL = 1, NAK = 2, VALID = 3 };
            EA: 0, 4;
        }
    }

    pub fn register(usb: &RegisterBlock, endpoint: usize) -> Epr<'_> {
        Epr {
            EPR: &usb.EPR[endpoint],
        }
    }

    /// Plain read / write bits.
    const KEEP: u32 = EPR::EA::mask | EPR::EP_TYPE::mask | EPR::EP_KIND::mask;

    /// Cleared by writing zero; writing one leaves them.
    const CTR: u32 = EPR::CTR_RX::mask | EPR::CTR_TX::mask;

    /// Flipped by writing one.
    pub const TOGGLES: u32 = EPR::DTOG_RX::mask
        | EPR::STAT_RX::mask
        | EPR::DTOG_TX::mask
        | EPR::STAT_TX::mask;

    /// Returns the value that moves the toggle bits under `mask` from
    /// `current` to `desired`. Every other bit keeps its value.
    pub const fn toggle_to(current: u32, mask: u32, desired: u32) -> u32 {
        (current & KEEP) | CTR | toggle_bits(current, mask, desired)
    }

    /// Returns only the toggle bits of [`toggle_to`].
    pub const fn toggle_bits(current: u32, mask: u32, desired: u32) -> u32 {
        (current ^ desired) & mask & TOGGLES
    }

    /// Returns the value that clears the `ctr` flags, and nothing else.
    pub const fn clear_ctr(current: u32, ctr: u32) -> u32 {
        (current & KEEP) | (CTR & !ctr)
    }

    /// Returns the value that sets the address and type, leaving the
    /// toggle bits and the flags alone.
    pub const fn configure(number: u32, ep_type: u32) -> u32 {
        CTR | (number << EPR::EA::offset) | (ep_type << EPR::EP_TYPE::offset)
    }

}
