#![no_std]

use core::{convert::TryFrom, fmt};

/// Number of bytes in an encoded bulk container header.
pub const CONTAINER_HEADER_LEN: usize = 12;
/// Maximum number of u32 parameters carried by command/response containers.
pub const MAX_CONTAINER_PARAMS: usize = 5;
/// Storage/handle wildcard meaning "all" in enumeration queries.
pub const ALL_STORAGES: u32 = 0xFFFF_FFFF;
/// Association handle meaning "root of the storage" in GetObjectHandles.
pub const PARENT_ROOT: u32 = 0xFFFF_FFFF;
/// Parent handle value reported for objects directly under a storage root.
pub const HANDLE_STORAGE_ROOT: u32 = 0;

/// PTP standard version reported by GetDeviceInfo (1.00 in hundredths).
pub const STANDARD_VERSION: u16 = 100;
/// MTP vendor extension ID.
pub const MTP_VENDOR_EXTENSION_ID: u32 = 0x0000_0006;
/// MTP vendor extension version (1.00 in hundredths).
pub const MTP_VENDOR_EXTENSION_VERSION: u16 = 100;
/// MTP vendor extension description string.
pub const MTP_VENDOR_EXTENSION_DESC: &str = "microsoft.com: 1.0;";
/// Functional mode reported by GetDeviceInfo (standard operation).
pub const FUNCTIONAL_MODE_STANDARD: u16 = 0;

/// Object format for files without a more specific format.
pub const OBJECT_FORMAT_UNDEFINED: u16 = 0x3000;
/// Object format for directories.
pub const OBJECT_FORMAT_ASSOCIATION: u16 = 0x3001;
/// Association type for generic folders.
pub const ASSOCIATION_TYPE_GENERIC_FOLDER: u16 = 0x0001;

/// StorageInfo storage type: fixed RAM.
pub const STORAGE_TYPE_FIXED_RAM: u16 = 0x0003;
/// StorageInfo filesystem type: generic hierarchical.
pub const FILESYSTEM_TYPE_HIERARCHICAL: u16 = 0x0002;
/// StorageInfo access capability: read-write.
pub const ACCESS_CAPABILITY_READ_WRITE: u16 = 0x0000;
/// StorageInfo access capability: read-only without object deletion.
pub const ACCESS_CAPABILITY_READ_ONLY: u16 = 0x0001;
/// FreeSpaceInObjects value for filesystems that do not track it.
pub const FREE_SPACE_OBJECTS_UNTRACKED: u32 = 0xFFFF_FFFF;

/// PTP data type codes used in property descriptions.
pub const DATA_TYPE_U8: u16 = 0x0002;
pub const DATA_TYPE_U16: u16 = 0x0004;
pub const DATA_TYPE_U32: u16 = 0x0006;
pub const DATA_TYPE_U64: u16 = 0x0008;
pub const DATA_TYPE_U128: u16 = 0x000A;
pub const DATA_TYPE_STRING: u16 = 0xFFFF;

/// Property get/set flags.
pub const PROP_GET: u8 = 0x00;
pub const PROP_GET_SET: u8 = 0x01;
/// Property form flag: no form.
pub const PROP_FORM_NONE: u8 = 0x00;
/// Property form flag: range form.
pub const PROP_FORM_RANGE: u8 = 0x01;
/// Default (and only supported) object property group.
pub const PROPERTY_GROUP_DEFAULT: u32 = 0x0000_0000;

/// Errors surfaced while decoding wire entities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer length did not match the protocol expectation.
    InvalidLength { expected: usize, actual: usize },
    /// Container type field is not a known container type.
    InvalidContainerType(u16),
    /// Container length field is inconsistent with its type.
    InvalidContainerLength(u32),
    /// More parameters than a command/response container can carry.
    TooManyParams(usize),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::InvalidLength { expected, actual } => {
                write!(f, "invalid message length {actual}, expected {expected}")
            }
            ProtoError::InvalidContainerType(ty) => write!(f, "invalid container type {ty:#06x}"),
            ProtoError::InvalidContainerLength(len) => write!(f, "invalid container length {len}"),
            ProtoError::TooManyParams(count) => write!(f, "too many parameters ({count})"),
        }
    }
}

/// Result alias for wire decoding operations.
pub type Result<T> = core::result::Result<T, ProtoError>;

/// Bulk container type discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ContainerType {
    Command = 1,
    Data = 2,
    Response = 3,
    Event = 4,
}

impl TryFrom<u16> for ContainerType {
    type Error = ProtoError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Self::Command),
            2 => Ok(Self::Data),
            3 => Ok(Self::Response),
            4 => Ok(Self::Event),
            other => Err(ProtoError::InvalidContainerType(other)),
        }
    }
}

impl From<ContainerType> for u16 {
    fn from(ty: ContainerType) -> Self {
        ty as u16
    }
}

/// Fixed 12-byte header preceding every bulk container.
///
/// `length` counts the full container including this header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerHeader {
    pub length: u32,
    pub kind: ContainerType,
    pub code: u16,
    pub transaction_id: u32,
}

impl ContainerHeader {
    pub const fn new(length: u32, kind: ContainerType, code: u16, transaction_id: u32) -> Self {
        Self {
            length,
            kind,
            code,
            transaction_id,
        }
    }

    pub fn encode(self) -> [u8; CONTAINER_HEADER_LEN] {
        let mut buf = [0u8; CONTAINER_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..6].copy_from_slice(&u16::from(self.kind).to_le_bytes());
        buf[6..8].copy_from_slice(&self.code.to_le_bytes());
        buf[8..12].copy_from_slice(&self.transaction_id.to_le_bytes());
        buf
    }

    pub fn decode(bytes: [u8; CONTAINER_HEADER_LEN]) -> Result<Self> {
        let length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let kind = ContainerType::try_from(u16::from_le_bytes([bytes[4], bytes[5]]))?;
        let code = u16::from_le_bytes([bytes[6], bytes[7]]);
        let transaction_id = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if (length as usize) < CONTAINER_HEADER_LEN {
            return Err(ProtoError::InvalidContainerLength(length));
        }
        Ok(Self {
            length,
            kind,
            code,
            transaction_id,
        })
    }

    /// Payload byte count following the header.
    pub fn payload_len(&self) -> usize {
        self.length as usize - CONTAINER_HEADER_LEN
    }
}

impl TryFrom<&[u8]> for ContainerHeader {
    type Error = ProtoError;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() != CONTAINER_HEADER_LEN {
            return Err(ProtoError::InvalidLength {
                expected: CONTAINER_HEADER_LEN,
                actual: value.len(),
            });
        }
        let mut buf = [0u8; CONTAINER_HEADER_LEN];
        buf.copy_from_slice(value);
        Self::decode(buf)
    }
}

/// Direction of the data phase associated with an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataPhase {
    /// No data phase.
    None,
    /// Device sends data to the host.
    In,
    /// Host sends data to the device.
    Out,
}

/// Operations understood by the responder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OperationCode {
    GetDeviceInfo = 0x1001,
    OpenSession = 0x1002,
    CloseSession = 0x1003,
    GetStorageIds = 0x1004,
    GetStorageInfo = 0x1005,
    GetObjectHandles = 0x1007,
    GetObjectInfo = 0x1008,
    GetObject = 0x1009,
    DeleteObject = 0x100B,
    SendObjectInfo = 0x100C,
    SendObject = 0x100D,
    GetDevicePropDesc = 0x1014,
    GetDevicePropValue = 0x1015,
    MoveObject = 0x1019,
    GetPartialObject = 0x101B,
    GetObjectPropsSupported = 0x9802,
    GetObjectPropDesc = 0x9803,
    GetObjectPropValue = 0x9804,
    SetObjectPropValue = 0x9805,
    GetObjectPropList = 0x9810,
}

impl OperationCode {
    /// Every operation the responder reports in GetDeviceInfo.
    pub const ALL: [OperationCode; 20] = [
        OperationCode::GetDeviceInfo,
        OperationCode::OpenSession,
        OperationCode::CloseSession,
        OperationCode::GetStorageIds,
        OperationCode::GetStorageInfo,
        OperationCode::GetObjectHandles,
        OperationCode::GetObjectInfo,
        OperationCode::GetObject,
        OperationCode::DeleteObject,
        OperationCode::SendObjectInfo,
        OperationCode::SendObject,
        OperationCode::GetDevicePropDesc,
        OperationCode::GetDevicePropValue,
        OperationCode::MoveObject,
        OperationCode::GetPartialObject,
        OperationCode::GetObjectPropsSupported,
        OperationCode::GetObjectPropDesc,
        OperationCode::GetObjectPropValue,
        OperationCode::SetObjectPropValue,
        OperationCode::GetObjectPropList,
    ];

    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|op| u16::from(*op) == value)
    }

    /// Direction of the operation's data phase. Fixed by the code.
    pub fn data_phase(self) -> DataPhase {
        match self {
            OperationCode::OpenSession
            | OperationCode::CloseSession
            | OperationCode::DeleteObject
            | OperationCode::MoveObject => DataPhase::None,
            OperationCode::SendObjectInfo
            | OperationCode::SendObject
            | OperationCode::SetObjectPropValue => DataPhase::Out,
            _ => DataPhase::In,
        }
    }

    /// Whether the operation is only valid inside an open session.
    pub fn requires_session(self) -> bool {
        !matches!(
            self,
            OperationCode::GetDeviceInfo
                | OperationCode::OpenSession
                | OperationCode::GetDevicePropDesc
                | OperationCode::GetDevicePropValue
        )
    }
}

impl From<OperationCode> for u16 {
    fn from(op: OperationCode) -> Self {
        op as u16
    }
}

/// Response codes the responder can answer with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ResponseCode {
    Ok = 0x2001,
    GeneralError = 0x2002,
    SessionNotOpen = 0x2003,
    InvalidTransactionId = 0x2004,
    OperationNotSupported = 0x2005,
    ParameterNotSupported = 0x2006,
    IncompleteTransfer = 0x2007,
    InvalidStorageId = 0x2008,
    InvalidObjectHandle = 0x2009,
    DevicePropNotSupported = 0x200A,
    StoreFull = 0x200C,
    ObjectWriteProtected = 0x200D,
    StoreReadOnly = 0x200E,
    AccessDenied = 0x200F,
    PartialDeletion = 0x2012,
    SpecificationByFormatUnsupported = 0x2014,
    NoValidObjectInfo = 0x2015,
    InvalidParentObject = 0x201A,
    InvalidParameter = 0x201D,
    SessionAlreadyOpen = 0x201E,
    InvalidObjectPropCode = 0xA801,
    InvalidObjectPropValue = 0xA803,
    SpecificationByGroupUnsupported = 0xA807,
    SpecificationByDepthUnsupported = 0xA808,
}

impl From<ResponseCode> for u16 {
    fn from(code: ResponseCode) -> Self {
        code as u16
    }
}

/// Object properties supported through the 0x98xx operation family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ObjectPropCode {
    StorageId = 0xDC01,
    ObjectFormat = 0xDC02,
    ObjectSize = 0xDC04,
    ObjectFileName = 0xDC07,
    ParentObject = 0xDC0B,
    PersistentUniqueObjectIdentifier = 0xDC41,
}

impl ObjectPropCode {
    /// Every object property reported by GetObjectPropsSupported.
    pub const ALL: [ObjectPropCode; 6] = [
        ObjectPropCode::StorageId,
        ObjectPropCode::ObjectFormat,
        ObjectPropCode::ObjectSize,
        ObjectPropCode::ObjectFileName,
        ObjectPropCode::ParentObject,
        ObjectPropCode::PersistentUniqueObjectIdentifier,
    ];

    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|prop| u16::from(*prop) == value)
    }
}

impl From<ObjectPropCode> for u16 {
    fn from(prop: ObjectPropCode) -> Self {
        prop as u16
    }
}

/// Device properties supported by GetDevicePropDesc/GetDevicePropValue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum DevicePropCode {
    BatteryLevel = 0x5001,
    DeviceFriendlyName = 0xD402,
}

impl DevicePropCode {
    pub const ALL: [DevicePropCode; 2] =
        [DevicePropCode::BatteryLevel, DevicePropCode::DeviceFriendlyName];

    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|prop| u16::from(*prop) == value)
    }
}

impl From<DevicePropCode> for u16 {
    fn from(prop: DevicePropCode) -> Self {
        prop as u16
    }
}

/// Decoded command container: raw operation code, transaction id, parameters.
///
/// The code is kept raw so unsupported operations can still be answered with
/// the transaction id the host used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandBlock {
    pub code: u16,
    pub transaction_id: u32,
    pub params: heapless::Vec<u32, MAX_CONTAINER_PARAMS>,
}

impl CommandBlock {
    pub fn new(code: u16, transaction_id: u32, params: &[u32]) -> Result<Self> {
        if params.len() > MAX_CONTAINER_PARAMS {
            return Err(ProtoError::TooManyParams(params.len()));
        }
        let mut vec = heapless::Vec::new();
        for param in params {
            vec.push(*param).map_err(|_| ProtoError::TooManyParams(params.len()))?;
        }
        Ok(Self {
            code,
            transaction_id,
            params: vec,
        })
    }

    /// Parameter at `index`, or 0 when the host omitted it.
    pub fn param(&self, index: usize) -> u32 {
        self.params.get(index).copied().unwrap_or(0)
    }

    pub fn operation(&self) -> Option<OperationCode> {
        OperationCode::from_u16(self.code)
    }

    /// Encode header + parameters as one wire container.
    pub fn encode(&self) -> heapless::Vec<u8, { CONTAINER_HEADER_LEN + 4 * MAX_CONTAINER_PARAMS }> {
        encode_block(ContainerType::Command, self.code, self.transaction_id, &self.params)
    }

    /// Decode the parameter payload that followed `header`.
    pub fn decode(header: &ContainerHeader, payload: &[u8]) -> Result<Self> {
        let params = decode_params(header, payload)?;
        Ok(Self {
            code: header.code,
            transaction_id: header.transaction_id,
            params,
        })
    }
}

/// Encoded response container: code, transaction id, parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseBlock {
    pub code: ResponseCode,
    pub transaction_id: u32,
    pub params: heapless::Vec<u32, MAX_CONTAINER_PARAMS>,
}

impl ResponseBlock {
    pub fn new(code: ResponseCode, transaction_id: u32, params: &[u32]) -> Result<Self> {
        if params.len() > MAX_CONTAINER_PARAMS {
            return Err(ProtoError::TooManyParams(params.len()));
        }
        let mut vec = heapless::Vec::new();
        for param in params {
            vec.push(*param).map_err(|_| ProtoError::TooManyParams(params.len()))?;
        }
        Ok(Self {
            code,
            transaction_id,
            params: vec,
        })
    }

    pub fn encode(&self) -> heapless::Vec<u8, { CONTAINER_HEADER_LEN + 4 * MAX_CONTAINER_PARAMS }> {
        encode_block(
            ContainerType::Response,
            self.code.into(),
            self.transaction_id,
            &self.params,
        )
    }
}

fn encode_block(
    kind: ContainerType,
    code: u16,
    transaction_id: u32,
    params: &[u32],
) -> heapless::Vec<u8, { CONTAINER_HEADER_LEN + 4 * MAX_CONTAINER_PARAMS }> {
    let length = (CONTAINER_HEADER_LEN + 4 * params.len()) as u32;
    let header = ContainerHeader::new(length, kind, code, transaction_id);
    let mut buf: heapless::Vec<u8, { CONTAINER_HEADER_LEN + 4 * MAX_CONTAINER_PARAMS }> =
        heapless::Vec::new();
    buf.extend_from_slice(&header.encode()).unwrap();
    for param in params {
        buf.extend_from_slice(&param.to_le_bytes()).unwrap();
    }
    buf
}

fn decode_params(
    header: &ContainerHeader,
    payload: &[u8],
) -> Result<heapless::Vec<u32, MAX_CONTAINER_PARAMS>> {
    let expected = header.payload_len();
    if payload.len() != expected {
        return Err(ProtoError::InvalidLength {
            expected,
            actual: payload.len(),
        });
    }
    if payload.len() % 4 != 0 || payload.len() / 4 > MAX_CONTAINER_PARAMS {
        return Err(ProtoError::InvalidContainerLength(header.length));
    }
    let mut params = heapless::Vec::new();
    for chunk in payload.chunks_exact(4) {
        let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        params.push(value).map_err(|_| ProtoError::TooManyParams(payload.len() / 4))?;
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = ContainerHeader::new(24, ContainerType::Command, 0x1009, 7);
        let bytes = header.encode();
        assert_eq!(ContainerHeader::decode(bytes).unwrap(), header);
        assert_eq!(header.payload_len(), 12);
    }

    #[test]
    fn header_rejects_bad_type() {
        let mut bytes = ContainerHeader::new(12, ContainerType::Data, 0x1009, 1).encode();
        bytes[4] = 9;
        assert!(matches!(
            ContainerHeader::decode(bytes),
            Err(ProtoError::InvalidContainerType(9))
        ));
    }

    #[test]
    fn header_rejects_short_length() {
        let mut bytes = ContainerHeader::new(12, ContainerType::Data, 0x1009, 1).encode();
        bytes[0..4].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            ContainerHeader::decode(bytes),
            Err(ProtoError::InvalidContainerLength(4))
        ));
    }

    #[test]
    fn command_round_trip() {
        let cmd = CommandBlock::new(
            OperationCode::GetObjectHandles.into(),
            3,
            &[1, 0, PARENT_ROOT],
        )
        .unwrap();
        let encoded = cmd.encode();
        let header = ContainerHeader::try_from(&encoded[..CONTAINER_HEADER_LEN]).unwrap();
        assert_eq!(header.kind, ContainerType::Command);
        assert_eq!(header.length as usize, encoded.len());
        let decoded = CommandBlock::decode(&header, &encoded[CONTAINER_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, cmd);
        assert_eq!(decoded.operation(), Some(OperationCode::GetObjectHandles));
        assert_eq!(decoded.param(2), PARENT_ROOT);
        assert_eq!(decoded.param(4), 0);
    }

    #[test]
    fn command_rejects_excess_params() {
        assert!(matches!(
            CommandBlock::new(0x1001, 1, &[0; 6]),
            Err(ProtoError::TooManyParams(6))
        ));
    }

    #[test]
    fn response_encodes_only_used_params() {
        let resp = ResponseBlock::new(ResponseCode::Ok, 9, &[1, 2]).unwrap();
        let encoded = resp.encode();
        assert_eq!(encoded.len(), CONTAINER_HEADER_LEN + 8);
        let header = ContainerHeader::try_from(&encoded[..CONTAINER_HEADER_LEN]).unwrap();
        assert_eq!(header.kind, ContainerType::Response);
        assert_eq!(header.code, u16::from(ResponseCode::Ok));
    }

    #[test]
    fn operation_lookup_and_direction() {
        assert_eq!(OperationCode::from_u16(0x1009), Some(OperationCode::GetObject));
        assert_eq!(OperationCode::from_u16(0x1006), None);
        assert_eq!(OperationCode::GetObject.data_phase(), DataPhase::In);
        assert_eq!(OperationCode::SendObject.data_phase(), DataPhase::Out);
        assert_eq!(OperationCode::DeleteObject.data_phase(), DataPhase::None);
        assert!(!OperationCode::GetDeviceInfo.requires_session());
        assert!(OperationCode::GetObjectHandles.requires_session());
    }

    #[test]
    fn params_must_be_word_aligned() {
        let header = ContainerHeader::new(15, ContainerType::Command, 0x1002, 1);
        assert!(CommandBlock::decode(&header, &[0u8; 3]).is_err());
    }
}
