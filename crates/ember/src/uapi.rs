//! # Request Interface
//!
//! Typed form of the device's request set. Every request carries a stable
//! [`Opcode`] and a reserved [`Ext`] pair; raw wire fields (type codes,
//! handles, payload bytes) are decoded and validated here before anything
//! reaches the [`Device`].

use core::time::Duration;

use ember_cmd::SubmitType;
use ember_core::{BoHandle, ContextHandle, Error, PAGE_SIZE, Result};
use ember_mem::{BoDesc, BoInfo, BoType, SyncDirection, VaEntry};

use crate::device::{Device, Submit};
use crate::hwctx::{ContextCreated, ContextDesc, ContextParam, CuConfig, DebugBufKind};
use crate::records::{CuConfigEntry, CuConfigHeader, DebugBufferRecord, UcInfo, read_record};
use crate::telemetry::{ArrayParam, ArrayReply, InfoParam, StateParam};

/// Opcodes, numbered as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    /// Create a hardware context
    CreateHwContext     = 0,
    /// Destroy a hardware context
    DestroyHwContext    = 1,
    /// Configure a hardware context
    ConfigureHwContext  = 2,
    /// Create a buffer object
    CreateBufferObject  = 3,
    /// Buffer object mapping information
    GetBufferObjectInfo = 4,
    /// Buffer object cache-coherence boundary
    SyncBufferObject    = 5,
    /// Submit to a hardware context
    ExecuteCommand      = 6,
    /// Single-record query
    GetInfo             = 7,
    /// Change a device attribute
    SetState            = 8,
    /// Wait for a sequence number
    WaitCommand         = 9,
    /// Array query
    GetInfoArray        = 10,
}

impl Opcode {
    /// Decode a wire value
    pub const fn from_raw(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Self::CreateHwContext,
            1 => Self::DestroyHwContext,
            2 => Self::ConfigureHwContext,
            3 => Self::CreateBufferObject,
            4 => Self::GetBufferObjectInfo,
            5 => Self::SyncBufferObject,
            6 => Self::ExecuteCommand,
            7 => Self::GetInfo,
            8 => Self::SetState,
            9 => Self::WaitCommand,
            10 => Self::GetInfoArray,
            _ => return Err(Error::InvalidArgument("unknown opcode")),
        })
    }
}

/// Reserved extension pair; must be zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ext {
    /// Extension pointer
    pub ext: u64,
    /// Extension flags
    pub ext_flags: u64,
}

impl Ext {
    fn check(self) -> Result<()> {
        if self.ext != 0 || self.ext_flags != 0 {
            return Err(Error::InvalidArgument("reserved extension fields must be zero"));
        }
        Ok(())
    }
}

/// Configuration parameter types
const CONFIG_CU: u32 = 0;
const CONFIG_ASSIGN_DBG_BUF: u32 = 1;
const CONFIG_REMOVE_DBG_BUF: u32 = 2;
const CONFIG_OPCODE_TIMEOUT: u32 = 3;

// =============================================================================
// REQUESTS
// =============================================================================

/// A decoded request
#[derive(Debug)]
pub enum Request<'a> {
    /// Create a hardware context
    CreateHwContext(ContextDesc),
    /// Destroy a hardware context
    DestroyHwContext {
        /// Context handle
        handle: u32,
    },
    /// Configure a hardware context
    ConfigureHwContext {
        /// Context handle
        handle: u32,
        /// Parameter type
        param_type: u32,
        /// Inline value (timeout in milliseconds)
        param_val: u64,
        /// Payload (CU configuration, debug buffer)
        payload: &'a [u8],
    },
    /// Create a buffer object
    CreateBufferObject {
        /// Object type code
        kind: u32,
        /// Size in bytes
        size: u64,
        /// Owning heap for `Dev` objects, 0 otherwise
        heap: u32,
        /// Pinned user memory, empty for none
        va_table: &'a [VaEntry],
    },
    /// Buffer object mapping information
    GetBufferObjectInfo {
        /// Buffer object handle
        handle: u32,
    },
    /// Buffer object cache-coherence boundary
    SyncBufferObject {
        /// Buffer object handle
        handle: u32,
        /// Direction code
        direction: u32,
        /// Range start
        offset: u64,
        /// Range size, 0 for the rest of the object
        size: u64,
    },
    /// Submit to a hardware context
    ExecuteCommand {
        /// Context handle
        handle: u32,
        /// Submission type code
        kind: u32,
        /// `Cmd` buffer objects (`ExecBuf` only)
        cmd_handles: &'a [u32],
        /// Argument buffer objects (`ExecBuf`) or sequence numbers (`Dependency`)
        args: &'a [u64],
    },
    /// Single-record query
    GetInfo {
        /// Query parameter code
        param: u32,
        /// Reply buffer
        buf: &'a mut [u8],
    },
    /// Change a device attribute
    SetState {
        /// Attribute code
        param: u32,
        /// Payload
        buf: &'a [u8],
    },
    /// Wait for a sequence number
    WaitCommand {
        /// Context handle
        handle: u32,
        /// Sequence number
        seq: u64,
        /// Milliseconds, 0 waits without bound
        timeout_ms: u32,
    },
    /// Array query
    GetInfoArray {
        /// Query parameter code
        param: u32,
        /// Bytes per element, 0 to query the element count
        element_size: u32,
        /// Element capacity of `buf`
        num_element: u32,
        /// Reply buffer
        buf: &'a mut [u8],
    },
}

impl Request<'_> {
    /// Opcode of the request
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::CreateHwContext(_) => Opcode::CreateHwContext,
            Self::DestroyHwContext { .. } => Opcode::DestroyHwContext,
            Self::ConfigureHwContext { .. } => Opcode::ConfigureHwContext,
            Self::CreateBufferObject { .. } => Opcode::CreateBufferObject,
            Self::GetBufferObjectInfo { .. } => Opcode::GetBufferObjectInfo,
            Self::SyncBufferObject { .. } => Opcode::SyncBufferObject,
            Self::ExecuteCommand { .. } => Opcode::ExecuteCommand,
            Self::GetInfo { .. } => Opcode::GetInfo,
            Self::SetState { .. } => Opcode::SetState,
            Self::WaitCommand { .. } => Opcode::WaitCommand,
            Self::GetInfoArray { .. } => Opcode::GetInfoArray,
        }
    }
}

/// Reply to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Nothing to report
    Done,
    /// New hardware context
    HwContext(ContextCreated),
    /// New buffer object
    BufferObject(BoHandle),
    /// Buffer object mapping information
    BufferInfo(BoInfo),
    /// Assigned sequence number
    Sequence(u64),
    /// Bytes written by a single-record query
    Written(usize),
    /// Shape of an array reply
    Array(ArrayReply),
}

// =============================================================================
// PAYLOAD DECODING
// =============================================================================

fn check_payload(payload: &[u8]) -> Result<()> {
    if payload.len() as u64 > PAGE_SIZE {
        return Err(Error::InvalidArgument("payload larger than a page"));
    }
    Ok(())
}

fn decode_cus(payload: &[u8]) -> Result<Vec<CuConfig>> {
    let header: CuConfigHeader = read_record(payload)?;
    if header.pad != [0; 3] {
        return Err(Error::InvalidArgument("non-zero padding"));
    }
    let entries = &payload[core::mem::size_of::<CuConfigHeader>()..];
    let stride = core::mem::size_of::<CuConfigEntry>();
    if entries.len() < header.num_cus as usize * stride {
        return Err(Error::InvalidArgument("payload shorter than num_cus entries"));
    }
    entries
        .chunks_exact(stride)
        .take(header.num_cus as usize)
        .map(|chunk| {
            let entry: CuConfigEntry = read_record(chunk)?;
            if entry.pad != [0; 3] {
                return Err(Error::InvalidArgument("non-zero padding"));
            }
            Ok(CuConfig {
                bo: BoHandle::from_raw(entry.cu_bo),
                func: entry.cu_func,
            })
        })
        .collect()
}

fn decode_debug(payload: &[u8]) -> Result<(DebugBufferRecord, Vec<UcInfo>)> {
    let record: DebugBufferRecord = read_record(payload)?;
    if record.pad != [0; 6] || record.reserved != [0; 48] {
        return Err(Error::InvalidArgument("non-zero padding"));
    }
    let rest = &payload[core::mem::size_of::<DebugBufferRecord>()..];
    let stride = core::mem::size_of::<UcInfo>();
    if rest.len() < record.num_ucs as usize * stride {
        return Err(Error::InvalidArgument("payload shorter than num_ucs entries"));
    }
    let ucs = rest
        .chunks_exact(stride)
        .take(record.num_ucs as usize)
        .map(read_record)
        .collect::<Result<Vec<UcInfo>>>()?;
    Ok((record, ucs))
}

fn bo_handle(raw: u64) -> Result<BoHandle> {
    u32::try_from(raw)
        .map(BoHandle::from_raw)
        .map_err(|_| Error::InvalidArgument("buffer object handle out of range"))
}

fn decode_config(param_type: u32, param_val: u64, payload: &[u8]) -> Result<ContextParam> {
    check_payload(payload)?;
    match param_type {
        CONFIG_CU => Ok(ContextParam::ConfigureCus(decode_cus(payload)?)),
        CONFIG_ASSIGN_DBG_BUF => {
            let (record, ucs) = decode_debug(payload)?;
            Ok(ContextParam::AssignDebugBuffer {
                kind: DebugBufKind::from_raw(record.buf_type)?,
                bo: bo_handle(record.bo_handle)?,
                command_id: record.command_id,
                ucs,
            })
        },
        CONFIG_REMOVE_DBG_BUF => {
            let (record, _) = decode_debug(payload)?;
            Ok(ContextParam::RemoveDebugBuffer {
                bo: bo_handle(record.bo_handle)?,
            })
        },
        CONFIG_OPCODE_TIMEOUT => {
            let ms = u32::try_from(param_val)
                .map_err(|_| Error::InvalidArgument("timeout out of range"))?;
            Ok(ContextParam::OpTimeout(ms))
        },
        _ => Err(Error::InvalidArgument("unknown configuration parameter")),
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

impl Device {
    /// Validate and carry out a request
    pub fn dispatch(&self, ext: Ext, request: Request<'_>) -> Result<Response> {
        ext.check()?;
        log::trace!("ember: {:?}", request.opcode());

        match request {
            Request::CreateHwContext(desc) => self.create_context(&desc).map(Response::HwContext),
            Request::DestroyHwContext { handle } => self
                .destroy_context(ContextHandle::from_raw(handle))
                .map(|()| Response::Done),
            Request::ConfigureHwContext {
                handle,
                param_type,
                param_val,
                payload,
            } => {
                let param = decode_config(param_type, param_val, payload)?;
                self.configure(ContextHandle::from_raw(handle), param)
                    .map(|()| Response::Done)
            },
            Request::CreateBufferObject {
                kind,
                size,
                heap,
                va_table,
            } => {
                let kind = BoType::from_raw(kind)?;
                let mut desc = match kind {
                    BoType::Dev => BoDesc::dev(BoHandle::from_raw(heap), size),
                    _ if heap != 0 => {
                        return Err(Error::InvalidArgument("heap given for a non-Dev object"));
                    },
                    kind => BoDesc::new(kind, size),
                };
                if !va_table.is_empty() {
                    desc = desc.with_va_table(va_table);
                }
                self.create_bo(&desc).map(Response::BufferObject)
            },
            Request::GetBufferObjectInfo { handle } => self
                .bo_info(BoHandle::from_raw(handle))
                .map(Response::BufferInfo),
            Request::SyncBufferObject {
                handle,
                direction,
                offset,
                size,
            } => {
                let direction = SyncDirection::from_raw(direction)?;
                self.sync_bo(BoHandle::from_raw(handle), direction, offset, size)
                    .map(|()| Response::Done)
            },
            Request::ExecuteCommand {
                handle,
                kind,
                cmd_handles,
                args,
            } => {
                let handle = ContextHandle::from_raw(handle);
                let seq = match SubmitType::from_raw(kind)? {
                    SubmitType::ExecBuf => {
                        let cmds: Vec<BoHandle> =
                            cmd_handles.iter().map(|&h| BoHandle::from_raw(h)).collect();
                        let args = args
                            .iter()
                            .map(|&a| bo_handle(a))
                            .collect::<Result<Vec<_>>>()?;
                        self.exec(handle, Submit::ExecBuf { cmds: &cmds, args: &args })?
                    },
                    SubmitType::Dependency => {
                        if !cmd_handles.is_empty() {
                            return Err(Error::InvalidArgument("dependency carries no commands"));
                        }
                        self.exec(handle, Submit::Dependency(args))?
                    },
                    SubmitType::Signal => {
                        if !cmd_handles.is_empty() || !args.is_empty() {
                            return Err(Error::InvalidArgument("signal carries no payload"));
                        }
                        self.exec(handle, Submit::Signal)?
                    },
                };
                Ok(Response::Sequence(seq))
            },
            Request::GetInfo { param, buf } => {
                let param = InfoParam::from_raw(param)?;
                self.get_info(param, buf).map(Response::Written)
            },
            Request::SetState { param, buf } => {
                check_payload(buf)?;
                let param = StateParam::from_raw(param)?;
                self.set_state(param, buf).map(|()| Response::Done)
            },
            Request::WaitCommand {
                handle,
                seq,
                timeout_ms,
            } => {
                let timeout =
                    (timeout_ms != 0).then(|| Duration::from_millis(u64::from(timeout_ms)));
                self.wait(ContextHandle::from_raw(handle), seq, timeout)
                    .map(|()| Response::Done)
            },
            Request::GetInfoArray {
                param,
                element_size,
                num_element,
                buf,
            } => {
                let param = ArrayParam::from_raw(param)?;
                self.get_info_array(param, element_size, num_element, buf)
                    .map(Response::Array)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytemuck::bytes_of;
    use ember_mem::HostMemory;

    use super::*;
    use crate::config::DeviceConfig;
    use crate::sim::SimNpu;

    fn device() -> (Arc<SimNpu>, Device) {
        let npu = Arc::new(SimNpu::new(4, 6, 8));
        let config = DeviceConfig::default().with_columns(4);
        let dev = Device::new(config, npu.clone(), Arc::new(HostMemory::new()));
        (npu, dev)
    }

    fn call(dev: &Device, request: Request<'_>) -> Result<Response> {
        dev.dispatch(Ext::default(), request)
    }

    fn create_bo(dev: &Device, kind: BoType, size: u64, heap: u32) -> u32 {
        let request = Request::CreateBufferObject {
            kind: kind as u32,
            size,
            heap,
            va_table: &[],
        };
        match call(dev, request) {
            Ok(Response::BufferObject(h)) => h.raw(),
            other => panic!("create failed: {other:?}"),
        }
    }

    fn create_raw_bo(dev: &Device, kind: u32, heap: u32) -> Result<Response> {
        call(dev, Request::CreateBufferObject {
            kind,
            size: 4096,
            heap,
            va_table: &[],
        })
    }

    fn create_ctx(dev: &Device, heap: u32, priority: u32) -> ContextHandle {
        let desc = ContextDesc::new(BoHandle::from_raw(heap), priority);
        match call(dev, Request::CreateHwContext(desc)) {
            Ok(Response::HwContext(created)) => created.handle,
            other => panic!("{other:?}"),
        }
    }

    fn configure(
        dev: &Device,
        ctx: u32,
        param_type: u32,
        param_val: u64,
        payload: &[u8],
    ) -> Result<Response> {
        call(dev, Request::ConfigureHwContext {
            handle: ctx,
            param_type,
            param_val,
            payload,
        })
    }

    fn execute(dev: &Device, ctx: u32, kind: u32, cmds: &[u32], args: &[u64]) -> Result<Response> {
        call(dev, Request::ExecuteCommand {
            handle: ctx,
            kind,
            cmd_handles: cmds,
            args,
        })
    }

    fn cu_payload(cus: &[(u32, u8)]) -> Vec<u8> {
        let header = CuConfigHeader { num_cus: cus.len() as u16, pad: [0; 3] };
        let mut payload = bytes_of(&header).to_vec();
        for &(cu_bo, cu_func) in cus {
            payload.extend_from_slice(bytes_of(&CuConfigEntry { cu_bo, cu_func, pad: [0; 3] }));
        }
        payload
    }

    #[test]
    fn test_scenario_through_opcodes() {
        let (npu, dev) = device();
        let heap = create_bo(&dev, BoType::DevHeap, 0x40_0000, 0);
        let cu_a = create_bo(&dev, BoType::Dev, 0x1000, heap);
        let cu_b = create_bo(&dev, BoType::Dev, 0x1000, heap);
        let cmd = create_bo(&dev, BoType::Cmd, 0x1000, 0);
        let ctx = create_ctx(&dev, heap, 0x100).raw();

        let payload = cu_payload(&[(cu_a, 0), (cu_b, 1)]);
        configure(&dev, ctx, 0, 0, &payload).unwrap();

        assert_eq!(execute(&dev, ctx, 0, &[cmd], &[]), Ok(Response::Sequence(1)));
        assert_eq!(execute(&dev, ctx, 1, &[], &[1]), Ok(Response::Sequence(2)));
        assert_eq!(execute(&dev, ctx, 2, &[], &[]), Ok(Response::Sequence(3)));

        let wait = |ms| call(&dev, Request::WaitCommand { handle: ctx, seq: 3, timeout_ms: ms });
        assert_eq!(wait(10), Err(Error::Timeout));

        let job = npu.running()[0].clone();
        npu.retire(job.fw_ctx, job.seq);
        dev.complete(job.ctx, job.seq, Ok(())).unwrap();
        assert_eq!(wait(0), Ok(Response::Done));

        assert_eq!(call(&dev, Request::DestroyHwContext { handle: ctx }), Ok(Response::Done));
    }

    #[test]
    fn test_reserved_ext_rejected() {
        let (_npu, dev) = device();
        let ext = Ext { ext: 0, ext_flags: 1 };
        assert!(matches!(
            dev.dispatch(ext, Request::GetBufferObjectInfo { handle: 1 }),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_payload_capped_at_a_page() {
        let (_npu, dev) = device();
        let big = vec![0u8; PAGE_SIZE as usize + 1];
        assert!(matches!(
            call(&dev, Request::SetState { param: 0, buf: &big }),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(configure(&dev, 1, 0, 0, &big), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_bad_type_codes() {
        let (_npu, dev) = device();
        assert!(create_raw_bo(&dev, 0, 0).is_err());
        assert!(create_raw_bo(&dev, 6, 0).is_err());
        assert!(create_raw_bo(&dev, 1, 3).is_err());

        let bo = create_bo(&dev, BoType::Share, 4096, 0);
        let sync = |direction| {
            call(&dev, Request::SyncBufferObject {
                handle: bo,
                direction,
                offset: 0,
                size: 0,
            })
        };
        assert!(sync(2).is_err());
        assert_eq!(sync(0), Ok(Response::Done));

        assert!(call(&dev, Request::GetInfo { param: 99, buf: &mut [] }).is_err());
        assert!(Opcode::from_raw(11).is_err());
        assert_eq!(Opcode::from_raw(9), Ok(Opcode::WaitCommand));
    }

    #[test]
    fn test_bo_info_offsets() {
        let (_npu, dev) = device();
        let heap = create_bo(&dev, BoType::DevHeap, 0x10_000, 0);
        let child = create_bo(&dev, BoType::Dev, 0x1000, heap);
        let info = |h| match call(&dev, Request::GetBufferObjectInfo { handle: h }) {
            Ok(Response::BufferInfo(info)) => info,
            other => panic!("{other:?}"),
        };
        assert_ne!(info(heap).map_offset, ember_core::INVALID_ADDR);
        assert_eq!(info(child).map_offset, ember_core::INVALID_ADDR);
        assert_eq!(info(child).device_addr, info(heap).device_addr);
    }

    #[test]
    fn test_cu_payload_validation() {
        let (_npu, dev) = device();
        let heap = create_bo(&dev, BoType::DevHeap, 0x10_000, 0);
        let ctx = create_ctx(&dev, heap, 0x200).raw();
        let image = create_bo(&dev, BoType::Share, 4096, 0);

        let mut short = cu_payload(&[(image, 0)]);
        short.truncate(12);
        assert!(configure(&dev, ctx, 0, 0, &short).is_err());

        let mut padded = cu_payload(&[(image, 0)]);
        padded[2] = 1;
        assert!(configure(&dev, ctx, 0, 0, &padded).is_err());

        let good = cu_payload(&[(image, 4)]);
        configure(&dev, ctx, 0, 0, &good).unwrap();
        let cus = dev.context(ContextHandle::from_raw(ctx)).unwrap().cus();
        assert_eq!(cus, vec![(BoHandle::from_raw(image), 4)]);

        configure(&dev, ctx, 3, 500, &[]).unwrap();
        assert!(configure(&dev, ctx, 4, 0, &[]).is_err());
    }

    #[test]
    fn test_debug_buffer_payload() {
        let (_npu, dev) = device();
        let heap = create_bo(&dev, BoType::DevHeap, 0x10_000, 0);
        let ctx = create_ctx(&dev, heap, 0x200);
        let trace = create_bo(&dev, BoType::Share, 8192, 0);
        let record = DebugBufferRecord {
            buf_type: DebugBufKind::Trace as u8,
            num_ucs: 1,
            reserved: [0; 48],
            pad: [0; 6],
            command_id: 7,
            bo_handle: u64::from(trace),
        };
        let mut payload = bytes_of(&record).to_vec();
        payload.extend_from_slice(bytes_of(&UcInfo { index: 0, size: 8192 }));

        configure(&dev, ctx.raw(), 1, 0, &payload).unwrap();
        assert_eq!(
            dev.context(ctx).unwrap().debug_buffers(),
            vec![(DebugBufKind::Trace, BoHandle::from_raw(trace))]
        );
        assert!(matches!(dev.destroy_bo(BoHandle::from_raw(trace)), Err(Error::InvalidState(_))));

        configure(&dev, ctx.raw(), 2, 0, &payload).unwrap();
        dev.destroy_bo(BoHandle::from_raw(trace)).unwrap();
    }
}
