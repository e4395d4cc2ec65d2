//! Mobileconfig (configuration profile plist) parsing and validation.
//!
//! Only the keys the reconciler needs are read: the top-level
//! `PayloadIdentifier`, `PayloadDisplayName` and `PayloadType`, plus every
//! nested `PayloadType` so that reserved payloads can be rejected.

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

use crate::types::ProfileContent;

/// Identifier of the product-managed disk-encryption (FileVault) profile.
pub const DISK_ENCRYPTION_PROFILE_IDENTIFIER: &str = "com.fleetdm.fleet.mdm.filevault";

/// Identifier of the product-managed agent configuration profile.
pub const FLEETD_CONFIG_PROFILE_IDENTIFIER: &str = "com.fleetdm.fleetd.config";

/// Identifiers owned by the product. Bulk replace never deletes them and
/// users can neither upload nor delete them.
pub const RESERVED_IDENTIFIERS: [&str; 2] = [
    DISK_ENCRYPTION_PROFILE_IDENTIFIER,
    FLEETD_CONFIG_PROFILE_IDENTIFIER,
];

/// Payload types only the product may deliver.
pub const RESERVED_PAYLOAD_TYPES: [&str; 3] = [
    "com.apple.MCX.FileVault2",
    "com.apple.security.FDERecoveryKeyEscrow",
    "com.apple.security.FDERecoveryRedirect",
];

/// Top-level payload type of a configuration profile.
pub const CONFIGURATION_PAYLOAD_TYPE: &str = "Configuration";

/// Whether `identifier` belongs to a product-managed profile.
#[must_use]
pub fn is_reserved_identifier(identifier: &str) -> bool {
    RESERVED_IDENTIFIERS.contains(&identifier)
}

/// Reserved identifiers as owned strings, for store queries.
#[must_use]
pub fn reserved_identifiers() -> Vec<String> {
    RESERVED_IDENTIFIERS.iter().map(ToString::to_string).collect()
}

/// Hex SHA-256 of a payload, used for change detection.
#[must_use]
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Errors reading a single mobileconfig.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MobileconfigError {
    #[error("profile is not valid UTF-8")]
    NotUtf8,

    #[error("profile is not a property list")]
    NotPlist,

    #[error("malformed XML: {0}")]
    Xml(String),

    #[error("missing {0}")]
    MissingKey(&'static str),
}

/// Rejected upload, with one entry per problem found.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration profiles: {}", problems.join("; "))]
pub struct ValidationError {
    pub problems: Vec<String>,
}

impl ValidationError {
    #[must_use]
    pub fn single(problem: impl Into<String>) -> Self {
        Self {
            problems: vec![problem.into()],
        }
    }
}

/// Keys read from a mobileconfig.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mobileconfig {
    pub identifier: String,
    pub display_name: String,
    pub payload_type: String,
    pub nested_payload_types: Vec<String>,
}

impl Mobileconfig {
    /// Parse the keys of an XML plist.
    pub fn parse(bytes: &[u8]) -> Result<Self, MobileconfigError> {
        let text = std::str::from_utf8(bytes).map_err(|_| MobileconfigError::NotUtf8)?;

        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut saw_plist = false;
        let mut depth = 0usize;
        let mut reading_key = false;
        let mut reading_string = false;
        let mut current_key: Option<String> = None;
        let mut string_key: Option<String> = None;
        let mut string_value = String::new();
        let mut parsed = Mobileconfig::default();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => match e.name().as_ref() {
                    b"plist" => saw_plist = true,
                    b"key" => reading_key = true,
                    b"string" => {
                        reading_string = true;
                        string_key = current_key.take();
                        string_value.clear();
                    }
                    b"dict" => {
                        current_key = None;
                        depth += 1;
                    }
                    _ => current_key = None,
                },
                Ok(Event::Empty(ref e)) => {
                    if e.name().as_ref() == b"string" {
                        parsed.assign(depth, current_key.take().as_deref(), "");
                    } else {
                        current_key = None;
                    }
                }
                Ok(Event::Text(ref e)) => {
                    let text = e
                        .unescape()
                        .map_err(|err| MobileconfigError::Xml(err.to_string()))?;
                    if reading_key {
                        current_key = Some(text.into_owned());
                    } else if reading_string {
                        string_value.push_str(&text);
                    }
                }
                Ok(Event::End(ref e)) => match e.name().as_ref() {
                    b"key" => reading_key = false,
                    b"string" => {
                        reading_string = false;
                        parsed.assign(depth, string_key.take().as_deref(), &string_value);
                    }
                    b"dict" => depth = depth.saturating_sub(1),
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(e) => return Err(MobileconfigError::Xml(e.to_string())),
                _ => {}
            }
            buf.clear();
        }

        if !saw_plist {
            return Err(MobileconfigError::NotPlist);
        }
        if parsed.identifier.trim().is_empty() {
            return Err(MobileconfigError::MissingKey("PayloadIdentifier"));
        }
        if parsed.display_name.trim().is_empty() {
            return Err(MobileconfigError::MissingKey("PayloadDisplayName"));
        }
        Ok(parsed)
    }

    fn assign(&mut self, depth: usize, key: Option<&str>, value: &str) {
        match (depth, key) {
            (1, Some("PayloadIdentifier")) => self.identifier = value.trim().to_string(),
            (1, Some("PayloadDisplayName")) => self.display_name = value.trim().to_string(),
            (1, Some("PayloadType")) => self.payload_type = value.trim().to_string(),
            (d, Some("PayloadType")) if d > 1 => {
                self.nested_payload_types.push(value.trim().to_string());
            }
            _ => {}
        }
    }

    /// Problems that prevent a user from uploading this profile.
    #[must_use]
    pub fn upload_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.payload_type != CONFIGURATION_PAYLOAD_TYPE {
            problems.push(format!(
                "{}: PayloadType must be {CONFIGURATION_PAYLOAD_TYPE}, got {:?}",
                self.identifier, self.payload_type
            ));
        }
        if is_reserved_identifier(&self.identifier) {
            problems.push(format!(
                "{}: identifier is reserved for profiles managed by fleet",
                self.identifier
            ));
        }
        for payload_type in &self.nested_payload_types {
            if RESERVED_PAYLOAD_TYPES.contains(&payload_type.as_str()) {
                problems.push(format!(
                    "{}: payload type {payload_type} is managed by fleet (use disk encryption settings)",
                    self.identifier
                ));
            }
        }
        problems
    }
}

/// Parse and validate a batch of user-supplied payloads.
///
/// Every payload is checked and every problem collected before returning, so
/// one call reports everything that needs fixing.
pub fn validate_batch(payloads: &[Vec<u8>]) -> Result<Vec<ProfileContent>, ValidationError> {
    let mut problems = Vec::new();
    let mut contents = Vec::with_capacity(payloads.len());
    let mut identifiers = HashSet::new();
    let mut names = HashSet::new();

    for (index, bytes) in payloads.iter().enumerate() {
        let parsed = match Mobileconfig::parse(bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                problems.push(format!("profile #{}: {e}", index + 1));
                continue;
            }
        };

        problems.extend(parsed.upload_problems());

        if !identifiers.insert(parsed.identifier.clone()) {
            problems.push(format!(
                "{}: duplicate PayloadIdentifier in batch",
                parsed.identifier
            ));
        }
        if !names.insert(parsed.display_name.clone()) {
            problems.push(format!(
                "{}: duplicate PayloadDisplayName {:?} in batch",
                parsed.identifier, parsed.display_name
            ));
        }

        contents.push(ProfileContent {
            identifier: parsed.identifier,
            name: parsed.display_name,
            checksum: checksum(bytes),
            mobileconfig: bytes.clone(),
        });
    }

    if problems.is_empty() {
        Ok(contents)
    } else {
        Err(ValidationError { problems })
    }
}

/// Build a minimal configuration profile plist.
///
/// `payloads` are `(PayloadType, PayloadIdentifier)` pairs placed in
/// `PayloadContent`.
#[must_use]
pub fn build_mobileconfig(identifier: &str, display_name: &str, payloads: &[(&str, &str)]) -> Vec<u8> {
    use quick_xml::escape::escape;

    let mut content = String::new();
    for (payload_type, payload_identifier) in payloads {
        content.push_str(&format!(
            "<dict><key>PayloadType</key><string>{}</string>\
             <key>PayloadIdentifier</key><string>{}</string>\
             <key>PayloadUUID</key><string>{}</string>\
             <key>PayloadVersion</key><integer>1</integer></dict>",
            escape(*payload_type),
            escape(*payload_identifier),
            uuid::Uuid::new_v4().to_string().to_uppercase(),
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
<key>PayloadContent</key>
<array>{content}</array>
<key>PayloadDisplayName</key>
<string>{}</string>
<key>PayloadIdentifier</key>
<string>{}</string>
<key>PayloadType</key>
<string>{CONFIGURATION_PAYLOAD_TYPE}</string>
<key>PayloadUUID</key>
<string>{}</string>
<key>PayloadVersion</key>
<integer>1</integer>
</dict>
</plist>
"#,
        escape(display_name),
        escape(identifier),
        uuid::Uuid::new_v4().to_string().to_uppercase(),
    )
    .into_bytes()
}

/// The product-managed profile that enforces FileVault and escrows the key.
#[must_use]
pub fn disk_encryption_profile() -> ProfileContent {
    let bytes = build_mobileconfig(
        DISK_ENCRYPTION_PROFILE_IDENTIFIER,
        "Disk encryption",
        &[
            (
                RESERVED_PAYLOAD_TYPES[0],
                "com.fleetdm.fleet.mdm.filevault.config",
            ),
            (
                RESERVED_PAYLOAD_TYPES[1],
                "com.fleetdm.fleet.mdm.filevault.escrow",
            ),
        ],
    );
    ProfileContent {
        identifier: DISK_ENCRYPTION_PROFILE_IDENTIFIER.to_string(),
        name: "Disk encryption".to_string(),
        checksum: checksum(&bytes),
        mobileconfig: bytes,
    }
}
