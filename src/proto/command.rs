use std::fmt;

use super::frame::{Event, Fields, ParseError, to_hex};

/// Legal extended-advertising interval range in milliseconds.
pub const MIN_ADV_INTERVAL_MS: u32 = 20;
pub const MAX_ADV_INTERVAL_MS: u32 = 10_240;

/// Oldest protocol revision with working extended advertising. Older stacks
/// answer SACP/SEAD with error 0x020C.
pub const MIN_PROTOCOL_VERSION: u16 = 0x0103;

/// Behavior flag bits carried in the `F` parameter.
pub const FLAG_AUTO_START: u8 = 0x01;
pub const FLAG_CUSTOM_DATA: u8 = 0x02;

#[derive(Debug, Clone)]
pub enum Command {
    // ---- Diagnostics ----
    Ping,
    QueryFirmwareVersion,

    // ---- Configuration ----
    SetDeviceName { name: String },
    SetAdvParameters(AdvParameters),
    GetAdvParameters,

    // ---- Advertising data ----
    SetAdvData { append: bool, data: Vec<u8> },
    GetAdvData,

    // ---- Advertising control ----
    StartAdvertising,
    StopAdvertising,
}

impl Command {
    pub fn opcode(&self) -> &'static str {
        match self {
            Command::Ping => "/PING",
            Command::QueryFirmwareVersion => "/QFV",
            Command::SetDeviceName { .. } => "SDN",
            Command::SetAdvParameters(_) => "SACP",
            Command::GetAdvParameters => "GACP",
            Command::SetAdvData { .. } => "SEAD",
            Command::GetAdvData => "GEAD",
            Command::StartAdvertising => "/CA",
            Command::StopAdvertising => "/CAX",
        }
    }

    /// Ordered wire parameters. SACP parameter order is fixed by the
    /// firmware's text-mode grammar.
    pub fn params(&self) -> Vec<(char, String)> {
        match self {
            Command::Ping
            | Command::QueryFirmwareVersion
            | Command::GetAdvParameters
            | Command::GetAdvData
            | Command::StartAdvertising
            | Command::StopAdvertising => Vec::new(),
            Command::SetDeviceName { name } => vec![('N', name.clone())],
            Command::SetAdvParameters(p) => p.params(),
            Command::SetAdvData { append, data } => vec![
                ('T', if *append { "01" } else { "00" }.to_string()),
                ('D', to_hex(data)),
            ],
        }
    }

    /// Every text-mode command solicits exactly one `@R` reply.
    pub fn expects_response(&self) -> bool {
        true
    }
}

/// Extended advertising configuration, the full SACP/GACP parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvParameters {
    pub mode: u8,               // P: 0 legacy, 1 extended, 2 periodic
    pub discovery: u8,          // M: 0 broadcast-only, 1 general
    pub adv_type: u8,           // T
    pub primary_phy: u8,        // H: 0 1M, 1 2M, 2 coded
    pub interval_units: u16,    // I: 0.625 ms units
    pub channels: u8,           // C: bit 0 ch37, bit 1 ch38, bit 2 ch39
    pub filter_policy: u8,      // L
    pub timeout_s: u16,         // O: 0 disables
    pub flags: u8,              // F
    pub direct_addr: [u8; 6],   // A
    pub direct_addr_type: u8,   // Y: 0 public, 1 random
    pub secondary_phy: u8,      // E
    pub secondary_max_skip: u8, // S
    pub sid: u8,                // D: 0..=0x0F
    pub periodic_units: u16,    // N: 1.25 ms units, periodic mode only
}

impl Default for AdvParameters {
    /// Extended non-connectable scannable broadcast carrying custom data,
    /// all three primary channels, 1M PHY, no timeout.
    fn default() -> Self {
        Self {
            mode: 1,
            discovery: 0,
            adv_type: 0x09,
            primary_phy: 0,
            interval_units: units_from_ms(MIN_ADV_INTERVAL_MS),
            channels: 0x07,
            filter_policy: 0,
            timeout_s: 0,
            flags: FLAG_CUSTOM_DATA,
            direct_addr: [0; 6],
            direct_addr_type: 0,
            secondary_phy: 0,
            secondary_max_skip: 0,
            sid: 0,
            periodic_units: 0,
        }
    }
}

impl AdvParameters {
    fn params(&self) -> Vec<(char, String)> {
        vec![
            ('P', format!("{:02X}", self.mode)),
            ('M', format!("{:02X}", self.discovery)),
            ('T', format!("{:02X}", self.adv_type)),
            ('H', format!("{:02X}", self.primary_phy)),
            ('I', format!("{:04X}", self.interval_units)),
            ('C', format!("{:02X}", self.channels)),
            ('L', format!("{:02X}", self.filter_policy)),
            ('O', format!("{:04X}", self.timeout_s)),
            ('F', format!("{:02X}", self.flags)),
            ('A', to_hex(&self.direct_addr)),
            ('Y', format!("{:02X}", self.direct_addr_type)),
            ('E', format!("{:02X}", self.secondary_phy)),
            ('S', format!("{:02X}", self.secondary_max_skip)),
            ('D', format!("{:02X}", self.sid)),
            ('N', format!("{:04X}", self.periodic_units)),
        ]
    }

    /// Typed view of a GACP reply.
    pub fn from_fields(f: &Fields) -> Result<Self, ParseError> {
        Ok(Self {
            mode: f.hex_u8("P")?,
            discovery: f.hex_u8("M")?,
            adv_type: f.hex_u8("T")?,
            primary_phy: f.hex_u8("H")?,
            interval_units: f.hex_u16("I")?,
            channels: f.hex_u8("C")?,
            filter_policy: f.hex_u8("L")?,
            timeout_s: f.hex_u16("O")?,
            flags: f.hex_u8("F")?,
            direct_addr: f.mac("A")?,
            direct_addr_type: f.hex_u8("Y")?,
            secondary_phy: f.hex_u8("E")?,
            secondary_max_skip: f.hex_u8("S")?,
            sid: f.hex_u8("D")?,
            periodic_units: f.hex_u16("N")?,
        })
    }

    pub fn interval_ms(&self) -> f64 {
        ms_from_units(self.interval_units)
    }
}

/// Interval fields are in 0.625 ms units.
pub fn units_from_ms(ms: u32) -> u16 {
    (ms * 8 / 5) as u16
}

pub fn ms_from_units(units: u16) -> f64 {
    units as f64 * 0.625
}

/// Version block reported by /QFV.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareInfo {
    pub app: u32,
    pub stack: u32,
    pub protocol: u16,
    pub hardware: u32,
}

impl FirmwareInfo {
    pub fn from_fields(f: &Fields) -> Result<Self, ParseError> {
        Ok(Self {
            app: f.hex_u32("E")?,
            stack: f.hex_u32("S")?,
            protocol: f.hex_u16("P")?,
            hardware: f.hex_u32("H")?,
        })
    }

    pub fn supports_extended_adv(&self) -> bool {
        self.protocol >= MIN_PROTOCOL_VERSION
    }
}

impl fmt::Display for FirmwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.app.to_be_bytes();
        write!(
            f,
            "app {}.{}.{}.{} protocol {}.{} stack {:08X} hw {:08X}",
            a,
            b,
            c,
            d,
            self.protocol >> 8,
            self.protocol & 0xFF,
            self.stack,
            self.hardware
        )
    }
}

/// Typed view of the unsolicited events this tool reacts to.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Advertising report observed by the module's receiver.
    AdvReport {
        addr: Option<[u8; 6]>,
        rssi: Option<i8>,
        data: Vec<u8>,
    },
    /// Anything else the firmware emits; kept only for the log.
    Other { name: String },
}

impl Notification {
    pub fn from_event(ev: &Event) -> Result<Self, ParseError> {
        match ev.name.as_str() {
            "AR" => Ok(Notification::AdvReport {
                addr: match ev.fields.get("A") {
                    Some(_) => Some(ev.fields.mac("A")?),
                    None => None,
                },
                rssi: match ev.fields.get("R") {
                    Some(_) => Some(ev.fields.rssi("R")?),
                    None => None,
                },
                data: ev.fields.hex_bytes("D")?,
            }),
            _ => Ok(Notification::Other {
                name: ev.name.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::frame::{Frame, parse_frame};
    use super::*;

    fn response_fields(body: &str) -> Fields {
        let line = format!("@R,{:04X},{}", body.len(), body);
        match parse_frame(&line).unwrap() {
            Frame::Response(r) => r.fields,
            _ => panic!("wrong variant"),
        }
    }

    fn event(body: &str) -> Event {
        let line = format!("@E,{:04X},{}", body.len(), body);
        match parse_frame(&line).unwrap() {
            Frame::Event(ev) => ev,
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn sacp_params_keep_wire_order() {
        let keys: String = Command::SetAdvParameters(AdvParameters::default())
            .params()
            .iter()
            .map(|(k, _)| *k)
            .collect();
        assert_eq!(keys, "PMTHICLOFAYESDN");
    }

    #[test]
    fn interval_unit_conversion() {
        assert_eq!(units_from_ms(20), 0x0020);
        assert_eq!(units_from_ms(100), 0x00A0);
        assert_eq!(units_from_ms(10_240), 0x4000);
        assert_eq!(ms_from_units(0x00A0), 100.0);
        assert_eq!(ms_from_units(0x0020), 20.0);
    }

    #[test]
    fn gacp_fields_roundtrip() {
        let p = AdvParameters {
            interval_units: 0x4000,
            direct_addr: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
            sid: 0x0F,
            ..AdvParameters::default()
        };
        let pairs: Vec<String> = p
            .params()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let fields = response_fields(&format!("GACP,0000,{}", pairs.join(",")));
        assert_eq!(AdvParameters::from_fields(&fields).unwrap(), p);
    }

    #[test]
    fn gacp_missing_field_is_rejected() {
        let fields = response_fields("GACP,0000,P=01,M=00");
        assert!(matches!(
            AdvParameters::from_fields(&fields),
            Err(ParseError::MissingField(_))
        ));
    }

    #[test]
    fn firmware_preflight_boundary() {
        let fields = response_fields("/QFV,0000,E=01040302,S=01040302,P=0102,H=00000001");
        let fw = FirmwareInfo::from_fields(&fields).unwrap();
        assert!(!fw.supports_extended_adv());
        let fw = FirmwareInfo {
            protocol: 0x0103,
            ..fw
        };
        assert!(fw.supports_extended_adv());
        assert!(fw.to_string().starts_with("app 1.4.3.2 protocol 1.3"));
    }

    #[test]
    fn adv_report_notification_parsing() {
        let ev = event("AR,A=001BDC06A3F2,R=CB,D=07FF09000000002A");
        match Notification::from_event(&ev).unwrap() {
            Notification::AdvReport { addr, rssi, data } => {
                assert_eq!(addr, Some([0x00, 0x1B, 0xDC, 0x06, 0xA3, 0xF2]));
                assert_eq!(rssi, Some(-53));
                assert_eq!(data.len(), 8);
            }
            _ => panic!("wrong variant"),
        }

        // Signal metadata is optional, payload is not.
        let ev = event("AR,D=07FF09000000002A");
        match Notification::from_event(&ev).unwrap() {
            Notification::AdvReport { addr, rssi, .. } => {
                assert!(addr.is_none());
                assert!(rssi.is_none());
            }
            _ => panic!("wrong variant"),
        }
        let ev = event("AR,R=CB");
        assert!(matches!(
            Notification::from_event(&ev),
            Err(ParseError::MissingField("D"))
        ));

        let ev = event("BOOT,C=01");
        assert!(matches!(
            Notification::from_event(&ev).unwrap(),
            Notification::Other { .. }
        ));
    }
}
