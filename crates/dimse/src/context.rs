//! Presentation contexts offered for each service class

use serde::{Deserialize, Serialize};

/// Verification SOP Class
pub const VERIFICATION: &str = "1.2.840.10008.1.1";

/// Study Root Query/Retrieve Information Model - FIND
pub const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";

/// Study Root Query/Retrieve Information Model - MOVE
pub const STUDY_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";

pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

/// Fixed default transfer syntax set, in order of preference
pub const DEFAULT_TRANSFER_SYNTAXES: &[&str] = &[
    IMPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_BIG_ENDIAN,
];

/// Storage SOP classes for the radiology modalities handled by this crate
pub const RADIOLOGY_STORAGE_CLASSES: &[&str] = &[
    "1.2.840.10008.5.1.4.1.1.1",        // Computed Radiography
    "1.2.840.10008.5.1.4.1.1.1.1",      // Digital X-Ray, for presentation
    "1.2.840.10008.5.1.4.1.1.1.1.1",    // Digital X-Ray, for processing
    "1.2.840.10008.5.1.4.1.1.1.2",      // Digital Mammography, for presentation
    "1.2.840.10008.5.1.4.1.1.1.2.1",    // Digital Mammography, for processing
    "1.2.840.10008.5.1.4.1.1.2",        // CT
    "1.2.840.10008.5.1.4.1.1.2.1",      // Enhanced CT
    "1.2.840.10008.5.1.4.1.1.3.1",      // Ultrasound Multi-frame
    "1.2.840.10008.5.1.4.1.1.4",        // MR
    "1.2.840.10008.5.1.4.1.1.4.1",      // Enhanced MR
    "1.2.840.10008.5.1.4.1.1.6.1",      // Ultrasound
    "1.2.840.10008.5.1.4.1.1.7",        // Secondary Capture
    "1.2.840.10008.5.1.4.1.1.12.1",     // X-Ray Angiographic
    "1.2.840.10008.5.1.4.1.1.12.2",     // X-Ray Radiofluoroscopic
    "1.2.840.10008.5.1.4.1.1.13.1.3",   // Breast Tomosynthesis
    "1.2.840.10008.5.1.4.1.1.20",       // Nuclear Medicine
    "1.2.840.10008.5.1.4.1.1.128",      // Positron Emission Tomography
    "1.2.840.10008.5.1.4.1.1.88.11",    // Basic Text SR
    "1.2.840.10008.5.1.4.1.1.88.22",    // Enhanced SR
    "1.2.840.10008.5.1.4.1.1.88.33",    // Comprehensive SR
    "1.2.840.10008.5.1.4.1.1.104.1",    // Encapsulated PDF
];

/// DIMSE service classes this crate negotiates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceClass {
    Verification,
    RadiologyStorage,
    StudyRootFind,
    StudyRootMove,
}

/// One proposed presentation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextSpec {
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// A presentation context the acceptor agreed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

impl ServiceClass {
    /// Abstract syntaxes proposed for this service class
    pub fn abstract_syntaxes(&self) -> &'static [&'static str] {
        match self {
            ServiceClass::Verification => &[VERIFICATION],
            ServiceClass::RadiologyStorage => RADIOLOGY_STORAGE_CLASSES,
            ServiceClass::StudyRootFind => &[STUDY_ROOT_FIND],
            ServiceClass::StudyRootMove => &[STUDY_ROOT_MOVE],
        }
    }
}

/// Presentation contexts for a service class using the fixed default transfer syntaxes
pub fn build_contexts(service: ServiceClass) -> Vec<PresentationContextSpec> {
    build_contexts_with(service, DEFAULT_TRANSFER_SYNTAXES)
}

/// Presentation contexts for a service class with an explicit transfer syntax list
pub fn build_contexts_with<S: AsRef<str>>(
    service: ServiceClass,
    transfer_syntaxes: &[S],
) -> Vec<PresentationContextSpec> {
    let transfer_syntaxes: Vec<String> = transfer_syntaxes
        .iter()
        .map(|ts| ts.as_ref().to_string())
        .collect();

    service
        .abstract_syntaxes()
        .iter()
        .map(|uid| PresentationContextSpec {
            abstract_syntax: uid.to_string(),
            transfer_syntaxes: transfer_syntaxes.clone(),
        })
        .collect()
}

/// Whether a transfer syntax uses native (unencapsulated) pixel data
pub fn is_native_transfer_syntax(uid: &str) -> bool {
    matches!(
        uid,
        IMPLICIT_VR_LITTLE_ENDIAN
            | EXPLICIT_VR_LITTLE_ENDIAN
            | DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN
            | EXPLICIT_VR_BIG_ENDIAN
    )
}

/// First accepted context for an abstract syntax
pub fn find_context<'a>(
    contexts: &'a [AcceptedContext],
    abstract_syntax: &str,
) -> Option<&'a AcceptedContext> {
    contexts.iter().find(|pc| pc.abstract_syntax == abstract_syntax)
}

/// Accepted context for an abstract syntax, preferring an exact transfer syntax match
pub fn find_context_for_transfer<'a>(
    contexts: &'a [AcceptedContext],
    abstract_syntax: &str,
    transfer_syntax: &str,
) -> Option<&'a AcceptedContext> {
    contexts
        .iter()
        .find(|pc| pc.abstract_syntax == abstract_syntax && pc.transfer_syntax == transfer_syntax)
        .or_else(|| find_context(contexts, abstract_syntax))
}

/// Trim the padding DICOM adds to UI values
pub fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches(|c: char| c == '\0' || c == ' ')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_has_single_context() {
        let contexts = build_contexts(ServiceClass::Verification);
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].abstract_syntax, VERIFICATION);
        assert_eq!(contexts[0].transfer_syntaxes, DEFAULT_TRANSFER_SYNTAXES);
    }

    #[test]
    fn test_storage_offers_every_radiology_class() {
        let contexts = build_contexts(ServiceClass::RadiologyStorage);
        assert_eq!(contexts.len(), RADIOLOGY_STORAGE_CLASSES.len());
        assert!(contexts
            .iter()
            .any(|pc| pc.abstract_syntax == "1.2.840.10008.5.1.4.1.1.2"));
        // the UL limits an association to 128 contexts
        assert!(contexts.len() <= 128);
    }

    #[test]
    fn test_query_retrieve_contexts() {
        assert_eq!(
            build_contexts(ServiceClass::StudyRootFind)[0].abstract_syntax,
            STUDY_ROOT_FIND
        );
        assert_eq!(
            build_contexts(ServiceClass::StudyRootMove)[0].abstract_syntax,
            STUDY_ROOT_MOVE
        );
    }

    #[test]
    fn test_explicit_transfer_syntax_list() {
        let contexts = build_contexts_with(ServiceClass::Verification, &[EXPLICIT_VR_LITTLE_ENDIAN]);
        assert_eq!(contexts[0].transfer_syntaxes, vec![EXPLICIT_VR_LITTLE_ENDIAN]);
    }

    #[test]
    fn test_context_lookup_prefers_matching_transfer_syntax() {
        let accepted = vec![
            AcceptedContext {
                id: 1,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".into(),
                transfer_syntax: IMPLICIT_VR_LITTLE_ENDIAN.into(),
            },
            AcceptedContext {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".into(),
                transfer_syntax: "1.2.840.10008.1.2.4.50".into(),
            },
        ];
        let pc = find_context_for_transfer(&accepted, "1.2.840.10008.5.1.4.1.1.2", "1.2.840.10008.1.2.4.50");
        assert_eq!(pc.map(|pc| pc.id), Some(3));
        let pc = find_context_for_transfer(&accepted, "1.2.840.10008.5.1.4.1.1.2", EXPLICIT_VR_LITTLE_ENDIAN);
        assert_eq!(pc.map(|pc| pc.id), Some(1));
        assert!(find_context(&accepted, VERIFICATION).is_none());
    }

    #[test]
    fn test_native_transfer_syntaxes() {
        assert!(is_native_transfer_syntax(EXPLICIT_VR_BIG_ENDIAN));
        assert!(!is_native_transfer_syntax("1.2.840.10008.1.2.4.50"));
        assert_eq!(trim_uid("1.2.3\0"), "1.2.3");
    }
}
