use std::cell::UnsafeCell;
use std::ffi::{c_char, c_void};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use vst3::Steinberg::Vst::BusDirections_::{kInput, kOutput};
use vst3::Steinberg::Vst::MediaTypes_::kAudio;
use vst3::Steinberg::Vst::ProcessModes_::kRealtime;
use vst3::Steinberg::Vst::SpeakerArr::{kMono, kStereo};
use vst3::Steinberg::Vst::SymbolicSampleSizes_::kSample32;
use vst3::Steinberg::Vst::{
    AudioBusBuffers, AudioBusBuffers__type0, BusInfo, IAudioProcessor,
    IAudioProcessorTrait as _, IComponent, IComponentHandler, IComponentHandlerTrait,
    IComponentTrait as _, IConnectionPoint, IConnectionPointTrait as _, IEditController,
    IEditControllerTrait as _, IHostApplication, IHostApplicationTrait, IParamValueQueue,
    IParamValueQueueTrait, IParameterChanges, IParameterChangesTrait,
    ParameterInfo as Vst3ParameterInfo, ProcessContext, ProcessData, ProcessSetup,
    SpeakerArrangement, String128,
};
use vst3::Steinberg::{
    self, FUnknown, IPluginBaseTrait as _, IPluginFactory, IPluginFactoryTrait as _, PClassInfo,
    kResultOk,
};
use vst3::{Class, ComPtr, ComWrapper, Interface};

use super::{
    HOST_CHANNELS, ParamChange, ParameterInfo, Plugin, PluginDescriptor, PluginFormat,
    ProcessError,
};
use crate::host::AudioConfig;

const AUDIO_MODULE_CLASS: &str = "Audio Module Class";

// ---------------------------------------------------------------------------
// String helpers
// ---------------------------------------------------------------------------

fn string128_to_string(s: &String128) -> String {
    let end = s.iter().position(|&c| c == 0).unwrap_or(s.len());
    String::from_utf16_lossy(&s[..end])
}

fn string_to_string128(s: &str) -> String128 {
    let mut buf: String128 = [0u16; 128];
    for (i, ch) in s.encode_utf16().take(127).enumerate() {
        buf[i] = ch;
    }
    buf
}

fn char_array_to_string(s: &[c_char]) -> String {
    let end = s.iter().position(|&c| c == 0).unwrap_or(s.len());
    s[..end].iter().map(|&c| c as u8 as char).collect()
}

/// Convert a `Guid` ([u8; 16]) to a TUID ([c_char; 16]) for passing to createInstance.
fn guid_to_tuid(guid: &vst3::com_scrape_types::Guid) -> Steinberg::TUID {
    let mut tuid: Steinberg::TUID = [0; 16];
    for (dst, &src) in tuid.iter_mut().zip(guid.iter()) {
        *dst = src as c_char;
    }
    tuid
}

/// Upper-case hex rendering of a class ID, used as the descriptor ID.
fn tuid_to_hex(tuid: &Steinberg::TUID) -> String {
    tuid.iter().fold(String::with_capacity(32), |mut s, &b| {
        let _ = write!(s, "{:02X}", b as u8);
        s
    })
}

// ---------------------------------------------------------------------------
// Platform-specific paths
// ---------------------------------------------------------------------------

/// Standard VST3 install locations for this platform.
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    #[cfg(target_os = "linux")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(".vst3"));
        }
        paths.push(PathBuf::from("/usr/lib/vst3"));
        paths.push(PathBuf::from("/usr/local/lib/vst3"));
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join("Library/Audio/Plug-Ins/VST3"));
        }
        paths.push(PathBuf::from("/Library/Audio/Plug-Ins/VST3"));
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            paths.push(PathBuf::from(local).join("Programs/Common/VST3"));
        }
        paths.push(PathBuf::from(r"C:\Program Files\Common Files\VST3"));
    }

    paths
}

/// Every `.vst3` bundle in the standard search paths plus `extra` directories.
pub fn bundle_paths(extra: &[PathBuf]) -> Vec<PathBuf> {
    search_paths()
        .iter()
        .chain(extra)
        .filter(|dir| dir.exists())
        .flat_map(|dir| super::find_bundles(dir, "vst3"))
        .collect()
}

/// Whether `path` names a VST3 binary: a `.vst3` file or a file inside a `.vst3` bundle.
fn is_vst3_binary(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("vst3"))
        || super::bundle_root(path, "vst3").is_some()
}

// ---------------------------------------------------------------------------
// Module loading
// ---------------------------------------------------------------------------

struct Vst3Module {
    factory: Option<ComPtr<IPluginFactory>>,
    exit_fn: Option<libloading::Symbol<'static, unsafe extern "C" fn() -> bool>>,
    // SAFETY: Library must be dropped after factory and exit_fn.
    // Rust drops fields in declaration order, so this is correct.
    _library: libloading::Library,
}

impl Vst3Module {
    fn load(binary: &Path) -> anyhow::Result<Self> {
        // Safety: loading external dynamic libraries is inherently unsafe
        let library = unsafe { libloading::Library::new(binary) }.map_err(|e| {
            anyhow::anyhow!("Failed to load VST3 library {}: {e}", binary.display())
        })?;

        #[cfg(target_os = "linux")]
        {
            let entry: libloading::Symbol<unsafe extern "C" fn(*mut c_void) -> bool> =
                unsafe { library.get(b"ModuleEntry") }
                    .map_err(|e| anyhow::anyhow!("ModuleEntry not found: {e}"))?;
            if !unsafe { entry(std::ptr::null_mut()) } {
                anyhow::bail!("ModuleEntry returned false");
            }
        }
        #[cfg(target_os = "macos")]
        {
            let entry: libloading::Symbol<unsafe extern "C" fn(*mut c_void) -> bool> =
                unsafe { library.get(b"bundleEntry") }
                    .map_err(|e| anyhow::anyhow!("bundleEntry not found: {e}"))?;
            if !unsafe { entry(std::ptr::null_mut()) } {
                anyhow::bail!("bundleEntry returned false");
            }
        }
        #[cfg(target_os = "windows")]
        {
            if let Ok(entry) = unsafe { library.get::<unsafe extern "C" fn() -> bool>(b"InitDll") }
            {
                if !unsafe { entry() } {
                    anyhow::bail!("InitDll returned false");
                }
            }
        }

        let exit_symbol: &[u8] = if cfg!(target_os = "macos") {
            b"bundleExit"
        } else if cfg!(target_os = "windows") {
            b"ExitDll"
        } else {
            b"ModuleExit"
        };
        // SAFETY: We transmute the lifetime of the Symbol to 'static because
        // we guarantee _library outlives exit_fn (field drop order).
        let exit_fn: Option<libloading::Symbol<'static, unsafe extern "C" fn() -> bool>> = unsafe {
            library
                .get::<unsafe extern "C" fn() -> bool>(exit_symbol)
                .ok()
                .map(|s| std::mem::transmute(s))
        };

        let get_factory: libloading::Symbol<unsafe extern "C" fn() -> *mut IPluginFactory> =
            unsafe { library.get(b"GetPluginFactory") }
                .map_err(|e| anyhow::anyhow!("GetPluginFactory not found: {e}"))?;
        let factory_ptr = unsafe { get_factory() };
        let factory = unsafe { ComPtr::from_raw(factory_ptr) }
            .ok_or_else(|| anyhow::anyhow!("GetPluginFactory returned null"))?;

        Ok(Vst3Module {
            factory: Some(factory),
            exit_fn,
            _library: library,
        })
    }

    fn factory(&self) -> anyhow::Result<&ComPtr<IPluginFactory>> {
        self.factory
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("VST3 factory already released"))
    }

    /// Audio Module classes exported by the factory, as (class ID, name).
    fn audio_classes(&self) -> anyhow::Result<Vec<(Steinberg::TUID, String)>> {
        let factory = self.factory()?;
        let count = unsafe { factory.countClasses() };
        let mut classes = Vec::new();
        for i in 0..count {
            let mut info: PClassInfo = unsafe { std::mem::zeroed() };
            if unsafe { factory.getClassInfo(i, &mut info) } != kResultOk {
                continue;
            }
            if char_array_to_string(&info.category) == AUDIO_MODULE_CLASS {
                classes.push((info.cid, char_array_to_string(&info.name)));
            }
        }
        Ok(classes)
    }
}

impl Drop for Vst3Module {
    fn drop(&mut self) {
        // Release COM references before the module exit hook runs
        self.factory.take();
        if let Some(ref exit) = self.exit_fn {
            unsafe {
                exit();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Host COM objects
// ---------------------------------------------------------------------------

struct MonoHostApp;

impl Class for MonoHostApp {
    type Interfaces = (IHostApplication,);
}

impl IHostApplicationTrait for MonoHostApp {
    unsafe fn getName(&self, name: *mut String128) -> Steinberg::tresult {
        unsafe { *name = string_to_string128("monohost") };
        kResultOk
    }

    unsafe fn createInstance(
        &self,
        _cid: *mut Steinberg::TUID,
        _iid: *mut Steinberg::TUID,
        _obj: *mut *mut c_void,
    ) -> Steinberg::tresult {
        vst3::Steinberg::kNotImplemented
    }
}

struct MonoComponentHandler;

impl Class for MonoComponentHandler {
    type Interfaces = (IComponentHandler,);
}

impl IComponentHandlerTrait for MonoComponentHandler {
    unsafe fn beginEdit(&self, _id: vst3::Steinberg::Vst::ParamID) -> Steinberg::tresult {
        kResultOk
    }

    unsafe fn performEdit(
        &self,
        _id: vst3::Steinberg::Vst::ParamID,
        _value_normalized: vst3::Steinberg::Vst::ParamValue,
    ) -> Steinberg::tresult {
        kResultOk
    }

    unsafe fn endEdit(&self, _id: vst3::Steinberg::Vst::ParamID) -> Steinberg::tresult {
        kResultOk
    }

    unsafe fn restartComponent(&self, _flags: Steinberg::int32) -> Steinberg::tresult {
        log::debug!("VST3 plugin requested restart (ignored)");
        kResultOk
    }
}

// ---------------------------------------------------------------------------
// Process-time COM objects
// ---------------------------------------------------------------------------

/// A single-point parameter queue at sample offset 0.
struct ParamQueue {
    param_id: UnsafeCell<u32>,
    value: UnsafeCell<f64>,
}

impl Class for ParamQueue {
    type Interfaces = (IParamValueQueue,);
}

impl IParamValueQueueTrait for ParamQueue {
    unsafe fn getParameterId(&self) -> vst3::Steinberg::Vst::ParamID {
        unsafe { *self.param_id.get() }
    }

    unsafe fn getPointCount(&self) -> Steinberg::int32 {
        1
    }

    unsafe fn getPoint(
        &self,
        index: Steinberg::int32,
        sample_offset: *mut Steinberg::int32,
        value: *mut vst3::Steinberg::Vst::ParamValue,
    ) -> Steinberg::tresult {
        if index == 0 {
            unsafe {
                *sample_offset = 0;
                *value = *self.value.get();
            }
            kResultOk
        } else {
            vst3::Steinberg::kResultFalse
        }
    }

    unsafe fn addPoint(
        &self,
        _sample_offset: Steinberg::int32,
        value: vst3::Steinberg::Vst::ParamValue,
        index: *mut Steinberg::int32,
    ) -> Steinberg::tresult {
        // Only the latest point is kept
        unsafe {
            *self.value.get() = value;
            if !index.is_null() {
                *index = 0;
            }
        }
        kResultOk
    }
}

const MAX_PARAM_QUEUES: usize = 64;

/// Fixed pool of parameter queues, reused every block.
struct ParamChanges {
    count: UnsafeCell<i32>,
    queues: Vec<ComWrapper<ParamQueue>>,
}

impl ParamChanges {
    fn new() -> ComWrapper<Self> {
        ComWrapper::new(ParamChanges {
            count: UnsafeCell::new(0),
            queues: (0..MAX_PARAM_QUEUES)
                .map(|_| {
                    ComWrapper::new(ParamQueue {
                        param_id: UnsafeCell::new(0),
                        value: UnsafeCell::new(0.0),
                    })
                })
                .collect(),
        })
    }

    /// Only called from the owning plugin while no process call is in flight.
    fn reset(&self) {
        unsafe { *self.count.get() = 0 };
    }

    /// Queue a normalized value; changes beyond the pool size are dropped.
    fn push(&self, param_id: u32, value: f64) {
        unsafe {
            let count = *self.count.get() as usize;
            if let Some(queue) = self.queues.get(count) {
                *queue.param_id.get() = param_id;
                *queue.value.get() = value;
                *self.count.get() = count as i32 + 1;
            }
        }
    }
}

impl Class for ParamChanges {
    type Interfaces = (IParameterChanges,);
}

impl IParameterChangesTrait for ParamChanges {
    unsafe fn getParameterCount(&self) -> Steinberg::int32 {
        unsafe { *self.count.get() }
    }

    unsafe fn getParameterData(&self, index: Steinberg::int32) -> *mut IParamValueQueue {
        if index >= 0 && index < unsafe { *self.count.get() } {
            self.queues
                .get(index as usize)
                .and_then(|q| q.as_com_ref::<IParamValueQueue>())
                .map(|r| r.as_ptr())
                .unwrap_or(std::ptr::null_mut())
        } else {
            std::ptr::null_mut()
        }
    }

    unsafe fn addParameterData(
        &self,
        id: *const vst3::Steinberg::Vst::ParamID,
        index: *mut Steinberg::int32,
    ) -> *mut IParamValueQueue {
        unsafe {
            let count = *self.count.get();
            let Some(queue) = self.queues.get(count as usize) else {
                return std::ptr::null_mut();
            };
            *queue.param_id.get() = *id;
            *queue.value.get() = 0.0;
            *self.count.get() = count + 1;
            if !index.is_null() {
                *index = count;
            }
            queue
                .as_com_ref::<IParamValueQueue>()
                .map(|r| r.as_ptr())
                .unwrap_or(std::ptr::null_mut())
        }
    }
}

// ---------------------------------------------------------------------------
// Format
// ---------------------------------------------------------------------------

/// VST3 plugins, addressed by their platform binary.
pub struct Vst3Format;

impl PluginFormat for Vst3Format {
    fn name(&self) -> &'static str {
        "vst3"
    }

    fn describe(&self, path: &Path) -> Option<PluginDescriptor> {
        if !is_vst3_binary(path) {
            return None;
        }
        let module = match Vst3Module::load(path) {
            Ok(module) => module,
            Err(e) => {
                log::debug!("Not a VST3 module: {} ({e:#})", path.display());
                return None;
            }
        };
        let classes = module.audio_classes().ok()?;
        let Some((cid, name)) = classes.into_iter().next() else {
            log::debug!("No {AUDIO_MODULE_CLASS} in {}", path.display());
            return None;
        };
        Some(PluginDescriptor {
            format: "vst3",
            path: path.to_path_buf(),
            id: tuid_to_hex(&cid),
            name,
        })
    }

    fn instantiate(
        &self,
        descriptor: &PluginDescriptor,
        _config: AudioConfig,
    ) -> anyhow::Result<Box<dyn Plugin>> {
        Ok(Box::new(Vst3Plugin::instantiate(descriptor)?))
    }
}

// ---------------------------------------------------------------------------
// Vst3Plugin
// ---------------------------------------------------------------------------

/// Channel layout of the first audio bus in one direction.
#[derive(Clone, Copy)]
struct BusLayout {
    present: bool,
    channels: usize,
}

pub struct Vst3Plugin {
    name: String,
    separate_controller: bool,
    params_cache: Vec<ParameterInfo>,
    param_ids: Vec<u32>,
    pending_param_changes: Vec<(u32, f64)>,
    input_bus: BusLayout,
    output_bus: BusLayout,
    config: Option<AudioConfig>,
    // Planar buffers sized by prepare(); the pointer arrays point into them.
    input_bufs: Vec<Vec<f32>>,
    output_bufs: Vec<Vec<f32>>,
    input_ptrs: Vec<*mut f32>,
    output_ptrs: Vec<*mut f32>,
    param_changes: ComWrapper<ParamChanges>,
    output_param_changes: ComWrapper<ParamChanges>,
    comp_connection: Option<ComPtr<IConnectionPoint>>,
    ctrl_connection: Option<ComPtr<IConnectionPoint>>,
    // COM pointers into the loaded library must drop before _module.
    component: ComPtr<IComponent>,
    processor: ComPtr<IAudioProcessor>,
    controller: ComPtr<IEditController>,
    _handler: ComWrapper<MonoComponentHandler>,
    _host_app: ComWrapper<MonoHostApp>,
    // SAFETY: _module must be the last field. It unloads the shared library on
    // drop, so all ComPtrs referencing objects from the library must drop first.
    _module: Vst3Module,
}

// Safety: Same contract as CLAP. Created and prepared on the control thread,
// moved into the audio callback where only process() runs, and handed back
// before release() or drop.
unsafe impl Send for Vst3Plugin {}

impl Drop for Vst3Plugin {
    fn drop(&mut self) {
        self.release();
        unsafe {
            if let (Some(cc), Some(tc)) = (&self.comp_connection, &self.ctrl_connection) {
                cc.disconnect(tc.as_ptr());
                tc.disconnect(cc.as_ptr());
            }
            if self.separate_controller {
                self.controller.terminate();
            }
            self.component.terminate();
        }
    }
}

impl Vst3Plugin {
    fn instantiate(descriptor: &PluginDescriptor) -> anyhow::Result<Self> {
        let module = Vst3Module::load(&descriptor.path)?;
        let class_cid = module
            .audio_classes()?
            .into_iter()
            .find(|(cid, _)| tuid_to_hex(cid) == descriptor.id)
            .map(|(cid, _)| cid)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "VST3 class {} not found in {}",
                    descriptor.id,
                    descriptor.path.display()
                )
            })?;

        let host_app = ComWrapper::new(MonoHostApp);
        let handler = ComWrapper::new(MonoComponentHandler);
        let host_unknown: ComPtr<FUnknown> = host_app
            .to_com_ptr::<FUnknown>()
            .ok_or_else(|| anyhow::anyhow!("Failed to get FUnknown from host app"))?;

        let factory = module.factory()?;

        let component: ComPtr<IComponent> = {
            let iid = guid_to_tuid(&<IComponent as Interface>::IID);
            let mut obj: *mut c_void = std::ptr::null_mut();
            let result =
                unsafe { factory.createInstance(class_cid.as_ptr(), iid.as_ptr(), &mut obj) };
            if result != kResultOk || obj.is_null() {
                anyhow::bail!("Failed to create VST3 component (result={result})");
            }
            unsafe { ComPtr::from_raw(obj as *mut IComponent) }
                .ok_or_else(|| anyhow::anyhow!("createInstance returned null IComponent"))?
        };

        let result = unsafe { component.initialize(host_unknown.as_ptr()) };
        if result != kResultOk {
            anyhow::bail!("IComponent::initialize failed (result={result})");
        }

        let processor: ComPtr<IAudioProcessor> = component
            .cast::<IAudioProcessor>()
            .ok_or_else(|| anyhow::anyhow!("Component does not implement IAudioProcessor"))?;

        // Single-component design first, then a separate controller class
        let (controller, separate_controller): (ComPtr<IEditController>, bool) =
            if let Some(ec) = component.cast::<IEditController>() {
                (ec, false)
            } else {
                let mut controller_cid: Steinberg::TUID = [0; 16];
                let result = unsafe { component.getControllerClassId(&mut controller_cid) };
                if result != kResultOk {
                    anyhow::bail!("Failed to get controller class ID (result={result})");
                }

                let iid = guid_to_tuid(&<IEditController as Interface>::IID);
                let mut obj: *mut c_void = std::ptr::null_mut();
                let result = unsafe {
                    factory.createInstance(controller_cid.as_ptr(), iid.as_ptr(), &mut obj)
                };
                if result != kResultOk || obj.is_null() {
                    anyhow::bail!("Failed to create separate IEditController (result={result})");
                }
                let ec = unsafe { ComPtr::from_raw(obj as *mut IEditController) }
                    .ok_or_else(|| anyhow::anyhow!("createInstance returned null controller"))?;

                let result = unsafe { ec.initialize(host_unknown.as_ptr()) };
                if result != kResultOk {
                    anyhow::bail!("IEditController::initialize failed (result={result})");
                }
                (ec, true)
            };

        let handler_ptr = handler
            .to_com_ptr::<IComponentHandler>()
            .ok_or_else(|| anyhow::anyhow!("Failed to get IComponentHandler from handler"))?;
        unsafe {
            controller.setComponentHandler(handler_ptr.as_ptr());
        }

        let (comp_connection, ctrl_connection) = if separate_controller {
            let comp_conn = component.cast::<IConnectionPoint>();
            let ctrl_conn = controller.cast::<IConnectionPoint>();
            if let (Some(cc), Some(tc)) = (&comp_conn, &ctrl_conn) {
                unsafe {
                    cc.connect(tc.as_ptr());
                    tc.connect(cc.as_ptr());
                }
            }
            (comp_conn, ctrl_conn)
        } else {
            (None, None)
        };

        let input_bus = bus_layout(&component, kInput as i32);
        let mut output_bus = bus_layout(&component, kOutput as i32);
        if !output_bus.present {
            log::warn!("VST3 plugin has no audio output bus, assuming stereo");
            output_bus.channels = HOST_CHANNELS;
        }

        let mut input_arr: SpeakerArrangement = arrangement(input_bus.channels);
        let mut output_arr: SpeakerArrangement = arrangement(output_bus.channels);
        unsafe {
            if input_bus.present {
                processor.setBusArrangements(&mut input_arr, 1, &mut output_arr, 1);
                component.activateBus(kAudio as i32, kInput as i32, 0, 1);
            } else {
                processor.setBusArrangements(std::ptr::null_mut(), 0, &mut output_arr, 1);
            }
            if output_bus.present {
                component.activateBus(kAudio as i32, kOutput as i32, 0, 1);
            }
        }

        let param_count = unsafe { controller.getParameterCount() };
        let mut params_cache = Vec::with_capacity(param_count.max(0) as usize);
        let mut param_ids = Vec::with_capacity(param_count.max(0) as usize);
        for i in 0..param_count {
            let mut info: Vst3ParameterInfo = unsafe { std::mem::zeroed() };
            if unsafe { controller.getParameterInfo(i, &mut info) } != kResultOk {
                continue;
            }
            let min = unsafe { controller.normalizedParamToPlain(info.id, 0.0) } as f32;
            let max = unsafe { controller.normalizedParamToPlain(info.id, 1.0) } as f32;
            let default = unsafe {
                controller.normalizedParamToPlain(info.id, info.defaultNormalizedValue)
            } as f32;

            params_cache.push(ParameterInfo {
                index: param_ids.len() as u32,
                name: string128_to_string(&info.title),
                min,
                max,
                default,
            });
            param_ids.push(info.id);
        }

        log::info!(
            "Instantiated VST3 plugin: {} ({} controller, inputs={}, outputs={}, params={})",
            descriptor.name,
            if separate_controller { "separate" } else { "single-component" },
            input_bus.channels,
            output_bus.channels,
            params_cache.len(),
        );

        Ok(Vst3Plugin {
            name: descriptor.name.clone(),
            separate_controller,
            pending_param_changes: Vec::with_capacity(params_cache.len()),
            params_cache,
            param_ids,
            input_bus,
            output_bus,
            config: None,
            input_bufs: Vec::new(),
            output_bufs: Vec::new(),
            input_ptrs: Vec::new(),
            output_ptrs: Vec::new(),
            param_changes: ParamChanges::new(),
            output_param_changes: ParamChanges::new(),
            comp_connection,
            ctrl_connection,
            component,
            processor,
            controller,
            _handler: handler,
            _host_app: host_app,
            _module: module,
        })
    }
}

fn bus_layout(component: &ComPtr<IComponent>, direction: i32) -> BusLayout {
    let count = unsafe { component.getBusCount(kAudio as i32, direction) };
    if count <= 0 {
        return BusLayout {
            present: false,
            channels: 0,
        };
    }
    let mut info: BusInfo = unsafe { std::mem::zeroed() };
    let result = unsafe { component.getBusInfo(kAudio as i32, direction, 0, &mut info) };
    if result != kResultOk {
        return BusLayout {
            present: true,
            channels: HOST_CHANNELS,
        };
    }
    log::debug!(
        "VST3 audio {} bus 0: channels={}, name={}",
        if direction == kInput as i32 { "input" } else { "output" },
        info.channelCount,
        string128_to_string(&info.name),
    );
    BusLayout {
        present: true,
        channels: if info.channelCount == 1 { 1 } else { HOST_CHANNELS },
    }
}

fn arrangement(channels: usize) -> SpeakerArrangement {
    if channels == 1 { kMono } else { kStereo }
}

// ---------------------------------------------------------------------------
// Plugin trait implementation
// ---------------------------------------------------------------------------

impl Plugin for Vst3Plugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> &'static str {
        "vst3"
    }

    fn parameters(&self) -> &[ParameterInfo] {
        &self.params_cache
    }

    fn get_parameter(&mut self, index: u32) -> Option<f32> {
        let param_id = *self.param_ids.get(index as usize)?;
        let normalized = unsafe { self.controller.getParamNormalized(param_id) };
        let plain = unsafe { self.controller.normalizedParamToPlain(param_id, normalized) };
        Some(plain as f32)
    }

    fn set_parameter(&mut self, index: u32, value: f32) -> anyhow::Result<()> {
        let param_id = *self
            .param_ids
            .get(index as usize)
            .ok_or_else(|| anyhow::anyhow!("Parameter index out of range: {index}"))?;
        let normalized = unsafe {
            self.controller
                .plainParamToNormalized(param_id, value as f64)
        };
        unsafe {
            self.controller.setParamNormalized(param_id, normalized);
        }
        self.pending_param_changes.push((param_id, normalized));
        Ok(())
    }

    fn prepare(&mut self, config: AudioConfig) -> anyhow::Result<()> {
        self.release();

        let mut setup = ProcessSetup {
            processMode: kRealtime as i32,
            symbolicSampleSize: kSample32 as i32,
            maxSamplesPerBlock: config.block_size as i32,
            sampleRate: config.sample_rate,
        };
        let result = unsafe { self.processor.setupProcessing(&mut setup) };
        if result != kResultOk {
            anyhow::bail!("VST3 setupProcessing failed (result={result})");
        }

        let result = unsafe { self.component.setActive(1) };
        if result != kResultOk {
            anyhow::bail!("IComponent::setActive(true) failed (result={result})");
        }
        let result = unsafe { self.processor.setProcessing(1) };
        if result != kResultOk {
            log::warn!("VST3 setProcessing returned {result}");
        }

        let frames = config.block_size;
        self.input_bufs = vec![vec![0.0; frames]; self.input_bus.channels];
        self.output_bufs = vec![vec![0.0; frames]; self.output_bus.channels];
        self.input_ptrs = self.input_bufs.iter_mut().map(|b| b.as_mut_ptr()).collect();
        self.output_ptrs = self.output_bufs.iter_mut().map(|b| b.as_mut_ptr()).collect();
        self.config = Some(config);
        Ok(())
    }

    fn process(
        &mut self,
        buffer: &mut [&mut [f32]],
        events: &[ParamChange],
    ) -> Result<(), ProcessError> {
        let config = self.config.ok_or(ProcessError::Inactive)?;

        let frames = buffer.first().map(|b| b.len()).unwrap_or(0);
        if frames == 0 {
            return Ok(());
        }
        if frames > config.block_size {
            return Err(ProcessError::BlockTooLarge {
                frames,
                max: config.block_size,
            });
        }

        self.param_changes.reset();
        self.output_param_changes.reset();
        for (param_id, value) in self.pending_param_changes.drain(..) {
            self.param_changes.push(param_id, value);
        }
        for change in events {
            if let Some(&param_id) = self.param_ids.get(change.index as usize) {
                let normalized = unsafe {
                    self.controller
                        .plainParamToNormalized(param_id, change.value as f64)
                };
                self.param_changes.push(param_id, normalized);
            }
        }

        for (ch, dst) in self.input_bufs.iter_mut().enumerate() {
            let dst = &mut dst[..frames];
            match buffer.get(ch) {
                Some(src) => copy_into(dst, src),
                None => dst.fill(0.0),
            }
        }
        for dst in &mut self.output_bufs {
            dst[..frames].fill(0.0);
        }

        let mut input_bus = AudioBusBuffers {
            numChannels: self.input_ptrs.len() as i32,
            silenceFlags: 0,
            __field0: AudioBusBuffers__type0 {
                channelBuffers32: self.input_ptrs.as_mut_ptr(),
            },
        };
        let mut output_bus = AudioBusBuffers {
            numChannels: self.output_ptrs.len() as i32,
            silenceFlags: 0,
            __field0: AudioBusBuffers__type0 {
                channelBuffers32: self.output_ptrs.as_mut_ptr(),
            },
        };

        let param_changes_ptr = self
            .param_changes
            .as_com_ref::<IParameterChanges>()
            .map(|r| r.as_ptr())
            .unwrap_or(std::ptr::null_mut());
        let output_param_changes_ptr = self
            .output_param_changes
            .as_com_ref::<IParameterChanges>()
            .map(|r| r.as_ptr())
            .unwrap_or(std::ptr::null_mut());

        let mut context: ProcessContext = unsafe { std::mem::zeroed() };
        context.sampleRate = config.sample_rate;

        let mut process_data = ProcessData {
            processMode: kRealtime as i32,
            symbolicSampleSize: kSample32 as i32,
            numSamples: frames as i32,
            numInputs: if self.input_bus.present { 1 } else { 0 },
            numOutputs: 1,
            inputs: if self.input_bus.present {
                &mut input_bus
            } else {
                std::ptr::null_mut()
            },
            outputs: &mut output_bus,
            inputParameterChanges: param_changes_ptr,
            outputParameterChanges: output_param_changes_ptr,
            inputEvents: std::ptr::null_mut(),
            outputEvents: std::ptr::null_mut(),
            processContext: &mut context,
        };

        let result = unsafe { self.processor.process(&mut process_data) };
        if result != kResultOk {
            return Err(ProcessError::Rejected(result));
        }

        // A mono output feeds both host channels.
        let left = self.output_bufs.first();
        let right = self.output_bufs.get(1).or(left);
        for (dst, src) in buffer.iter_mut().zip([left, right]) {
            match src {
                Some(src) => copy_into(dst, &src[..frames]),
                None => dst.fill(0.0),
            }
        }

        Ok(())
    }

    fn release(&mut self) {
        if self.config.take().is_some() {
            unsafe {
                self.processor.setProcessing(0);
                self.component.setActive(0);
            }
            log::debug!("VST3 plugin deactivated");
        }
    }
}

#[inline]
fn copy_into(dst: &mut [f32], src: &[f32]) {
    let len = dst.len().min(src.len());
    dst[..len].copy_from_slice(&src[..len]);
    dst[len..].fill(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_id_renders_as_hex() {
        let mut tuid: Steinberg::TUID = [0; 16];
        tuid[0] = 0x12u8 as c_char;
        tuid[15] = 0xFFu8 as c_char;
        let hex = tuid_to_hex(&tuid);
        assert_eq!(hex.len(), 32);
        assert!(hex.starts_with("12"));
        assert!(hex.ends_with("FF"));
    }

    #[test]
    fn string128_round_trip_truncates() {
        let s = string_to_string128("monohost");
        assert_eq!(string128_to_string(&s), "monohost");

        let long = "x".repeat(200);
        assert_eq!(string128_to_string(&string_to_string128(&long)).len(), 127);
    }

    #[test]
    fn recognises_vst3_binaries() {
        assert!(is_vst3_binary(Path::new("C:/VST3/Reverb.vst3")));
        assert!(is_vst3_binary(Path::new(
            "/usr/lib/vst3/Reverb.vst3/Contents/x86_64-linux/Reverb.so"
        )));
        assert!(!is_vst3_binary(Path::new("/usr/lib/clap/Reverb.clap")));
    }

    #[test]
    fn describe_rejects_garbage_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Broken.vst3");
        std::fs::write(&path, b"not a shared library").unwrap();
        assert!(Vst3Format.describe(&path).is_none());
    }

    #[test]
    fn param_changes_pool_is_bounded() {
        let changes = ParamChanges::new();
        for i in 0..(MAX_PARAM_QUEUES as u32 + 10) {
            changes.push(i, 0.5);
        }
        assert_eq!(
            unsafe { changes.getParameterCount() },
            MAX_PARAM_QUEUES as i32
        );
        changes.reset();
        assert_eq!(unsafe { changes.getParameterCount() }, 0);
    }
}
