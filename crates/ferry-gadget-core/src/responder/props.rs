//! Device and object property operations (the 0x1014/0x1015 pair and the
//! MTP 0x98xx family).

use super::PtpResponder;
use crate::events::SessionEvent;
use crate::parser::{Dataset, PtpDataParser};
use crate::transport::UsbBulk;
use crate::{Error, Result};
use ferry_proto::{
    CommandBlock, DevicePropCode, ObjectPropCode, ResponseCode, DATA_TYPE_STRING, DATA_TYPE_U128,
    DATA_TYPE_U16, DATA_TYPE_U32, DATA_TYPE_U64, DATA_TYPE_U8, OBJECT_FORMAT_ASSOCIATION,
    OBJECT_FORMAT_UNDEFINED, PROPERTY_GROUP_DEFAULT, PROP_FORM_NONE, PROP_GET, PROP_GET_SET,
};
use tracing::debug;

/// Battery level reported for a device with no battery of its own.
const BATTERY_LEVEL_FULL: u8 = 100;

/// Property code wildcard in GetObjectPropList.
const ALL_PROPERTIES: u32 = 0xFFFF_FFFF;

impl<T: UsbBulk + 'static> PtpResponder<T> {
    pub(super) async fn get_device_prop_desc(&mut self, command: &CommandBlock) -> Result<()> {
        let prop = DevicePropCode::from_u16(command.param(0) as u16)
            .ok_or(Error::Protocol(ResponseCode::DevicePropNotSupported))?;

        let mut ds = Dataset::new();
        ds.put_u16(prop.into());
        match prop {
            DevicePropCode::BatteryLevel => {
                ds.put_u16(DATA_TYPE_U8)
                    .put_u8(PROP_GET)
                    .put_u8(BATTERY_LEVEL_FULL) // factory default
                    .put_u8(BATTERY_LEVEL_FULL) // current
                    .put_u8(PROP_FORM_NONE);
            }
            DevicePropCode::DeviceFriendlyName => {
                let name = self.identity.friendly_name.clone();
                ds.put_u16(DATA_TYPE_STRING)
                    .put_u8(PROP_GET)
                    .put_string(&name)
                    .put_string(&name)
                    .put_u8(PROP_FORM_NONE);
            }
        }
        self.send_dataset(command, ds).await?;
        self.ok(command).await
    }

    pub(super) async fn get_device_prop_value(&mut self, command: &CommandBlock) -> Result<()> {
        let prop = DevicePropCode::from_u16(command.param(0) as u16)
            .ok_or(Error::Protocol(ResponseCode::DevicePropNotSupported))?;

        let mut ds = Dataset::new();
        match prop {
            DevicePropCode::BatteryLevel => {
                ds.put_u8(BATTERY_LEVEL_FULL);
            }
            DevicePropCode::DeviceFriendlyName => {
                ds.put_string(&self.identity.friendly_name.clone());
            }
        }
        self.send_dataset(command, ds).await?;
        self.ok(command).await
    }

    pub(super) async fn get_object_props_supported(&mut self, command: &CommandBlock) -> Result<()> {
        let props: Vec<u16> = ObjectPropCode::ALL.iter().map(|prop| u16::from(*prop)).collect();
        let mut ds = Dataset::new();
        ds.put_u16_array(&props);
        self.send_dataset(command, ds).await?;
        self.ok(command).await
    }

    pub(super) async fn get_object_prop_desc(&mut self, command: &CommandBlock) -> Result<()> {
        let prop = ObjectPropCode::from_u16(command.param(0) as u16)
            .ok_or(Error::Protocol(ResponseCode::InvalidObjectPropCode))?;

        // Each property maps to a pattern: data type, whether the host may
        // set it, and a default value.
        let mut ds = Dataset::new();
        ds.put_u16(prop.into());
        match prop {
            ObjectPropCode::PersistentUniqueObjectIdentifier => {
                ds.put_u16(DATA_TYPE_U128).put_u8(PROP_GET).put_u128(0);
            }
            ObjectPropCode::ObjectSize => {
                ds.put_u16(DATA_TYPE_U64).put_u8(PROP_GET).put_u64(0);
            }
            ObjectPropCode::StorageId => {
                // Default to the first (default) storage.
                ds.put_u16(DATA_TYPE_U32).put_u8(PROP_GET).put_u32(1);
            }
            ObjectPropCode::ParentObject => {
                ds.put_u16(DATA_TYPE_U32).put_u8(PROP_GET).put_u32(0);
            }
            ObjectPropCode::ObjectFormat => {
                ds.put_u16(DATA_TYPE_U16)
                    .put_u8(PROP_GET)
                    .put_u16(OBJECT_FORMAT_UNDEFINED);
            }
            ObjectPropCode::ObjectFileName => {
                ds.put_u16(DATA_TYPE_STRING).put_u8(PROP_GET_SET).put_string("");
            }
        }
        // Group code is required but carries no meaning here.
        ds.put_u32(PROPERTY_GROUP_DEFAULT).put_u8(PROP_FORM_NONE);
        self.send_dataset(command, ds).await?;
        self.ok(command).await
    }

    pub(super) async fn get_object_prop_value(&mut self, command: &CommandBlock) -> Result<()> {
        let handle = command.param(0);
        let prop = ObjectPropCode::from_u16(command.param(1) as u16)
            .ok_or(Error::Protocol(ResponseCode::InvalidObjectPropCode))?;

        let mut ds = Dataset::new();
        self.put_prop_value(&mut ds, handle, prop, false).await?;
        self.send_dataset(command, ds).await?;
        self.ok(command).await
    }

    pub(super) async fn get_object_prop_list(&mut self, command: &CommandBlock) -> Result<()> {
        let handle = command.param(0);
        let format = command.param(1);
        let prop_param = command.param(2);
        let group = command.param(3);
        let depth = command.param(4);

        if format != 0 {
            return Err(Error::Protocol(ResponseCode::InvalidParameter));
        }
        let selected = match prop_param {
            ALL_PROPERTIES => None,
            value => Some(
                ObjectPropCode::from_u16(value as u16)
                    .ok_or(Error::Protocol(ResponseCode::InvalidObjectPropCode))?,
            ),
        };
        if group != PROPERTY_GROUP_DEFAULT {
            return Err(Error::Protocol(ResponseCode::SpecificationByGroupUnsupported));
        }
        if depth != 0 {
            return Err(Error::Protocol(ResponseCode::SpecificationByDepthUnsupported));
        }

        let included: Vec<ObjectPropCode> = ObjectPropCode::ALL
            .into_iter()
            .filter(|prop| selected.is_none() || selected == Some(*prop))
            .collect();

        let mut ds = Dataset::new();
        ds.put_u32(included.len() as u32);
        for prop in included {
            ds.put_u32(handle).put_u16(prop.into());
            self.put_prop_value(&mut ds, handle, prop, true).await?;
        }
        self.send_dataset(command, ds).await?;
        self.ok(command).await
    }

    pub(super) async fn set_object_prop_value(&mut self, command: &CommandBlock) -> Result<()> {
        let handle = command.param(0);
        let prop = ObjectPropCode::from_u16(command.param(1) as u16);

        let mut parser = PtpDataParser::new(self.server.clone());
        self.expect_data_header(&mut parser, command).await?;

        // Renaming through ObjectFileName is the only writable property.
        if prop != Some(ObjectPropCode::ObjectFileName) {
            self.drain(&mut parser).await?;
            return Err(Error::Protocol(ResponseCode::InvalidObjectPropCode));
        }

        let new_name = parser.read_string().await?;
        self.drain(&mut parser).await?;
        if new_name.is_empty() || new_name.contains(['/', '\0']) {
            return Err(Error::Protocol(ResponseCode::InvalidObjectPropValue));
        }

        let (storage_id, relative) = self.resolve_handle(handle)?;
        self.vfs.ensure_writable(storage_id)?;
        let stat = self.fresh_stat(handle).await?;

        let destination = match relative.parent() {
            Some(parent) => parent.join(&new_name),
            None => new_name.clone().into(),
        };
        let from = self.display_path(storage_id, &relative)?;
        let to = self.display_path(storage_id, &destination)?;

        self.vfs.rename(storage_id, &relative, &destination).await?;
        self.heap.rename(handle, &new_name);
        debug!(handle, from = %from, to = %to, "object renamed");
        if stat.is_dir {
            self.events
                .emit(SessionEvent::RenameFolder { path: from, new_path: to });
        } else {
            self.events
                .emit(SessionEvent::RenameFile { path: from, new_path: to });
        }
        self.ok(command).await
    }

    /// Append one property value; property lists prefix each value with its
    /// data type code.
    async fn put_prop_value(
        &mut self,
        ds: &mut Dataset,
        handle: u32,
        prop: ObjectPropCode,
        with_type: bool,
    ) -> Result<()> {
        let entry = self
            .heap
            .get(handle)
            .ok_or(Error::Protocol(ResponseCode::InvalidObjectHandle))?;
        let storage_id = entry.storage_id;
        let parent = entry.parent;
        let name = entry.name.clone();

        match prop {
            ObjectPropCode::PersistentUniqueObjectIdentifier => {
                if with_type {
                    ds.put_u16(DATA_TYPE_U128);
                }
                ds.put_u128(u128::from(handle));
            }
            ObjectPropCode::ObjectSize => {
                let stat = self.fresh_stat(handle).await?;
                if with_type {
                    ds.put_u16(DATA_TYPE_U64);
                }
                ds.put_u64(stat.size);
            }
            ObjectPropCode::StorageId => {
                if with_type {
                    ds.put_u16(DATA_TYPE_U32);
                }
                ds.put_u32(storage_id);
            }
            ObjectPropCode::ParentObject => {
                if with_type {
                    ds.put_u16(DATA_TYPE_U32);
                }
                ds.put_u32(parent);
            }
            ObjectPropCode::ObjectFormat => {
                let stat = self.fresh_stat(handle).await?;
                if with_type {
                    ds.put_u16(DATA_TYPE_U16);
                }
                ds.put_u16(if stat.is_dir {
                    OBJECT_FORMAT_ASSOCIATION
                } else {
                    OBJECT_FORMAT_UNDEFINED
                });
            }
            ObjectPropCode::ObjectFileName => {
                if with_type {
                    ds.put_u16(DATA_TYPE_STRING);
                }
                ds.put_string(&name);
            }
        }
        Ok(())
    }
}
