//! Const per-node configuration parameters
//!
//! Typically lives in flash; a node keeps a `&'static` reference for its
//! lifetime. Holds the SNIP identity, the protocol-support bitmap, the
//! configuration options advertised over the Memory Configuration protocol,
//! one descriptor per supported address space and the embedded CDI/FDI XML.

use emlcb_core::ProtocolSupport;

/// Canonical address-space identifiers [4; 4.2]
pub mod space {
    /// Configuration Definition Info (CDI XML, read-only).
    pub const CONFIGURATION_DEFINITION: u8 = 0xFF;
    /// All memory.
    pub const ALL: u8 = 0xFE;
    /// User configuration memory.
    pub const CONFIG_MEMORY: u8 = 0xFD;
    /// ACDI manufacturer view (read-only SNIP fields).
    pub const ACDI_MANUFACTURER: u8 = 0xFC;
    /// ACDI user view (user name + description).
    pub const ACDI_USER: u8 = 0xFB;
    /// Train Function Definition Info.
    pub const TRAIN_FUNCTION_DEFINITION: u8 = 0xFA;
    /// Train function configuration memory.
    pub const TRAIN_FUNCTION_CONFIG: u8 = 0xF9;
    /// Firmware image (bootloader path).
    pub const FIRMWARE: u8 = 0xEF;
}

/// Fixed ACDI field offsets within spaces 0xFC and 0xFB [4; 5.1]
pub mod acdi {
    pub const MANUFACTURER_VERSION_ADDRESS: u32 = 0x00;
    pub const MANUFACTURER_ADDRESS: u32 = 0x01;
    pub const MODEL_ADDRESS: u32 = 0x2A;
    pub const HARDWARE_VERSION_ADDRESS: u32 = 0x53;
    pub const SOFTWARE_VERSION_ADDRESS: u32 = 0x68;

    pub const MANUFACTURER_LEN: usize = 41;
    pub const MODEL_LEN: usize = 41;
    pub const HARDWARE_VERSION_LEN: usize = 21;
    pub const SOFTWARE_VERSION_LEN: usize = 21;

    pub const USER_VERSION_ADDRESS: u32 = 0x00;
    pub const USER_NAME_ADDRESS: u32 = 0x01;
    pub const USER_DESCRIPTION_ADDRESS: u32 = 0x40;

    pub const USER_NAME_LEN: usize = 63;
    pub const USER_DESCRIPTION_LEN: usize = 64;
}

/// Properties of one configuration memory address space.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AddressSpace {
    pub present: bool,
    pub read_only: bool,
    pub low_address_valid: bool,
    pub low_address: u32,
    pub highest_address: u32,
    pub description: &'static str,
}

impl AddressSpace {
    pub const ABSENT: AddressSpace = AddressSpace {
        present: false,
        read_only: false,
        low_address_valid: false,
        low_address: 0,
        highest_address: 0,
        description: "",
    };

    pub const fn read_only(highest_address: u32, description: &'static str) -> Self {
        AddressSpace {
            present: true,
            read_only: true,
            low_address_valid: false,
            low_address: 0,
            highest_address,
            description,
        }
    }

    pub const fn read_write(highest_address: u32, description: &'static str) -> Self {
        AddressSpace {
            present: true,
            read_only: false,
            low_address_valid: false,
            low_address: 0,
            highest_address,
            description,
        }
    }
}

/// Capabilities reported by the Get Configuration Options command [4; 4.4]
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigurationOptions {
    pub write_under_mask: bool,
    pub unaligned_reads: bool,
    pub unaligned_writes: bool,
    pub read_acdi_manufacturer: bool,
    pub read_acdi_user: bool,
    pub write_acdi_user: bool,
    pub stream_read_write: bool,
    pub high_address_space: u8,
    pub low_address_space: u8,
    pub description: &'static str,
}

impl ConfigurationOptions {
    /// Available-commands bit field of the options reply.
    pub const fn to_available_bits(&self) -> u16 {
        (self.write_under_mask as u16) << 15
            | (self.unaligned_reads as u16) << 14
            | (self.unaligned_writes as u16) << 13
            | (self.read_acdi_manufacturer as u16) << 11
            | (self.read_acdi_user as u16) << 10
            | (self.write_acdi_user as u16) << 9
    }
}

/// SNIP identity strings and version bytes [2; SNIP]
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SnipIdent {
    pub mfg_version: u8,
    pub name: &'static str,
    pub model: &'static str,
    pub hardware_version: &'static str,
    pub software_version: &'static str,
    pub user_version: u8,
}

/// Complete const configuration of a virtual node.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeParameters {
    pub snip: SnipIdent,
    pub protocol_support: ProtocolSupport,
    /// Consumer events auto-registered at allocation, drawn from the node's
    /// reserved event space.
    pub consumer_count_autocreate: u8,
    /// Producer events auto-registered at allocation.
    pub producer_count_autocreate: u8,
    /// CDI XML, served verbatim from space 0xFF.
    pub cdi: &'static [u8],
    /// FDI XML for train nodes, served from space 0xFA; empty when absent.
    pub fdi: &'static [u8],
    pub configuration_options: ConfigurationOptions,
    pub address_space_configuration_definition: AddressSpace,
    pub address_space_all: AddressSpace,
    pub address_space_config_memory: AddressSpace,
    pub address_space_acdi_manufacturer: AddressSpace,
    pub address_space_acdi_user: AddressSpace,
    pub address_space_train_function_definition: AddressSpace,
    pub address_space_train_function_config: AddressSpace,
    pub address_space_firmware: AddressSpace,
    /// Base offset of the ACDI user name/description block in space 0xFD,
    /// letting multi-node applications place the 127-byte blocks at disjoint
    /// addresses.
    pub user_data_offset: u32,
}

impl NodeParameters {
    pub fn address_space(&self, space_id: u8) -> Option<&AddressSpace> {
        let space = match space_id {
            space::CONFIGURATION_DEFINITION => &self.address_space_configuration_definition,
            space::ALL => &self.address_space_all,
            space::CONFIG_MEMORY => &self.address_space_config_memory,
            space::ACDI_MANUFACTURER => &self.address_space_acdi_manufacturer,
            space::ACDI_USER => &self.address_space_acdi_user,
            space::TRAIN_FUNCTION_DEFINITION => &self.address_space_train_function_definition,
            space::TRAIN_FUNCTION_CONFIG => &self.address_space_train_function_config,
            space::FIRMWARE => &self.address_space_firmware,
            _ => return None,
        };
        Some(space)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_lookup() {
        let mut params = crate::node::test_support::TEST_PARAMETERS;
        params.address_space_firmware = AddressSpace::ABSENT;
        assert!(params.address_space(space::CONFIG_MEMORY).unwrap().present);
        assert!(!params.address_space(space::FIRMWARE).unwrap().present);
        assert!(params.address_space(0x42).is_none());
    }

    #[test]
    fn test_options_available_bits() {
        let options = ConfigurationOptions {
            write_under_mask: true,
            unaligned_reads: true,
            unaligned_writes: false,
            read_acdi_manufacturer: true,
            read_acdi_user: true,
            write_acdi_user: true,
            stream_read_write: false,
            high_address_space: space::CONFIGURATION_DEFINITION,
            low_address_space: space::TRAIN_FUNCTION_CONFIG,
            description: "",
        };
        assert_eq!(options.to_available_bits(), 0xCE00);
    }
}
