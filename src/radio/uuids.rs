//! GATT identifiers exposed by Meshtastic firmware.
use uuid::Uuid;

pub const MESHTASTIC_SERVICE: Uuid = Uuid::from_u128(0x6BA1B218_15A8_461F_9FA8_5DCAE273EAFD);
pub const TO_RADIO: Uuid = Uuid::from_u128(0xF75C76D2_129E_4DAD_A1DD_7866124401E7);
pub const FROM_RADIO: Uuid = Uuid::from_u128(0x2C55E69E_4993_11ED_B878_0242AC120002);
pub const FROM_NUM: Uuid = Uuid::from_u128(0xED9DA18C_A800_4F66_A670_AA7547E34453);
/// LogRecord protobufs (firmware 2.3.2+).
pub const LOG_RADIO: Uuid = Uuid::from_u128(0x5A3D6E49_06E6_4423_9944_E9DE8CDF9547);
/// Plain UTF-8 log lines (older firmware).
pub const LOG_RADIO_LEGACY: Uuid = Uuid::from_u128(0x6C6FD238_78FA_436B_AACF_15C5BE1EF2E2);

/// Characteristics requested after service discovery.
pub const CHARACTERISTICS: [Uuid; 5] = [TO_RADIO, FROM_RADIO, FROM_NUM, LOG_RADIO_LEGACY, LOG_RADIO];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    ToRadio,
    FromRadio,
    FromNum,
    LogRadio,
    LogRadioLegacy,
}

impl CharacteristicRole {
    const ALL: [Self; 5] = [
        Self::ToRadio,
        Self::FromRadio,
        Self::FromNum,
        Self::LogRadio,
        Self::LogRadioLegacy,
    ];

    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == *uuid)
    }

    pub fn uuid(self) -> Uuid {
        match self {
            Self::ToRadio => TO_RADIO,
            Self::FromRadio => FROM_RADIO,
            Self::FromNum => FROM_NUM,
            Self::LogRadio => LOG_RADIO,
            Self::LogRadioLegacy => LOG_RADIO_LEGACY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_forms_match_firmware() {
        assert_eq!(
            MESHTASTIC_SERVICE.to_string(),
            "6ba1b218-15a8-461f-9fa8-5dcae273eafd"
        );
        assert_eq!(LOG_RADIO.to_string(), "5a3d6e49-06e6-4423-9944-e9de8cdf9547");
    }

    #[test]
    fn roles_round_trip() {
        for uuid in CHARACTERISTICS {
            let role = CharacteristicRole::from_uuid(&uuid).unwrap();
            assert_eq!(role.uuid(), uuid);
        }
        assert_eq!(CharacteristicRole::from_uuid(&MESHTASTIC_SERVICE), None);
    }
}
