// Native result codes and the error value carried out of every engine call.
use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResultCode {
    Success,
    Failure,
    AlreadyInitialized,
    NotInitialized,
    CantLoadFile,
    ParmSetFailed,
    InvalidArgument,
    CantLoadGeo,
    CantGeneratePreset,
    CantLoadPreset,
    AssetDefAlreadyLoaded,
    NoLicenseFound,
    DisallowedNcLicenseFound,
    DisallowedNcAssetWithCLicense,
    DisallowedNcAssetWithLcLicense,
    DisallowedLcAssetWithCLicense,
    DisallowedIndieWithThirdPartyPlugin,
    AssetInvalid,
    NodeInvalid,
    UserInterrupted,
    InvalidSession,
    Unknown(i32),
}

impl ResultCode {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => ResultCode::Success,
            1 => ResultCode::Failure,
            2 => ResultCode::AlreadyInitialized,
            3 => ResultCode::NotInitialized,
            4 => ResultCode::CantLoadFile,
            5 => ResultCode::ParmSetFailed,
            6 => ResultCode::InvalidArgument,
            7 => ResultCode::CantLoadGeo,
            8 => ResultCode::CantGeneratePreset,
            9 => ResultCode::CantLoadPreset,
            10 => ResultCode::AssetDefAlreadyLoaded,
            110 => ResultCode::NoLicenseFound,
            120 => ResultCode::DisallowedNcLicenseFound,
            130 => ResultCode::DisallowedNcAssetWithCLicense,
            140 => ResultCode::DisallowedNcAssetWithLcLicense,
            150 => ResultCode::DisallowedLcAssetWithCLicense,
            160 => ResultCode::DisallowedIndieWithThirdPartyPlugin,
            200 => ResultCode::AssetInvalid,
            210 => ResultCode::NodeInvalid,
            300 => ResultCode::UserInterrupted,
            400 => ResultCode::InvalidSession,
            other => ResultCode::Unknown(other),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::Failure => 1,
            ResultCode::AlreadyInitialized => 2,
            ResultCode::NotInitialized => 3,
            ResultCode::CantLoadFile => 4,
            ResultCode::ParmSetFailed => 5,
            ResultCode::InvalidArgument => 6,
            ResultCode::CantLoadGeo => 7,
            ResultCode::CantGeneratePreset => 8,
            ResultCode::CantLoadPreset => 9,
            ResultCode::AssetDefAlreadyLoaded => 10,
            ResultCode::NoLicenseFound => 110,
            ResultCode::DisallowedNcLicenseFound => 120,
            ResultCode::DisallowedNcAssetWithCLicense => 130,
            ResultCode::DisallowedNcAssetWithLcLicense => 140,
            ResultCode::DisallowedLcAssetWithCLicense => 150,
            ResultCode::DisallowedIndieWithThirdPartyPlugin => 160,
            ResultCode::AssetInvalid => 200,
            ResultCode::NodeInvalid => 210,
            ResultCode::UserInterrupted => 300,
            ResultCode::InvalidSession => 400,
            ResultCode::Unknown(raw) => raw,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::Failure => "failure",
            ResultCode::AlreadyInitialized => "already initialized",
            ResultCode::NotInitialized => "not initialized",
            ResultCode::CantLoadFile => "cannot load file",
            ResultCode::ParmSetFailed => "parameter set failed",
            ResultCode::InvalidArgument => "invalid argument",
            ResultCode::CantLoadGeo => "cannot load geometry",
            ResultCode::CantGeneratePreset => "cannot generate preset",
            ResultCode::CantLoadPreset => "cannot load preset",
            ResultCode::AssetDefAlreadyLoaded => "asset definition already loaded",
            ResultCode::NoLicenseFound => "no license found",
            ResultCode::DisallowedNcLicenseFound => "disallowed non-commercial license found",
            ResultCode::DisallowedNcAssetWithCLicense => {
                "disallowed non-commercial asset with commercial license"
            }
            ResultCode::DisallowedNcAssetWithLcLicense => {
                "disallowed non-commercial asset with limited-commercial license"
            }
            ResultCode::DisallowedLcAssetWithCLicense => {
                "disallowed limited-commercial asset with commercial license"
            }
            ResultCode::DisallowedIndieWithThirdPartyPlugin => {
                "disallowed indie engine with third-party plugin"
            }
            ResultCode::AssetInvalid => "asset invalid",
            ResultCode::NodeInvalid => "node invalid",
            ResultCode::UserInterrupted => "user interrupted",
            ResultCode::InvalidSession => "invalid session",
            ResultCode::Unknown(_) => "unknown result",
        }
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

/// A failed native call: which call, and what it returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EngineError {
    pub call: &'static str,
    pub code: ResultCode,
}

impl EngineError {
    pub fn new(call: &'static str, code: ResultCode) -> Self {
        Self { call, code }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} returned {} ({})",
            self.call,
            self.code.raw(),
            self.code.message()
        )
    }
}

impl StdError for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::ResultCode;

    #[test]
    fn raw_codes_round_trip_through_known_variants() {
        for raw in [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 110, 120, 130, 140, 150, 160, 200, 210, 300, 400] {
            let code = ResultCode::from_raw(raw);
            assert!(!matches!(code, ResultCode::Unknown(_)), "raw {raw}");
            assert_eq!(code.raw(), raw);
        }
    }

    #[test]
    fn unlisted_codes_are_unknown() {
        assert_eq!(ResultCode::from_raw(11), ResultCode::Unknown(11));
        assert_eq!(ResultCode::from_raw(-5).message(), "unknown result");
        assert_eq!(ResultCode::from_raw(-5).raw(), -5);
    }
}
