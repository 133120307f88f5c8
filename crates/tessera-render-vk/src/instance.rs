// SPDX-License-Identifier: CEPL-1.0
use anyhow::{anyhow, Context, Result};
use ash::ext::debug_utils;
use ash::khr::surface;
use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_char, c_void, CStr};
use tracing::{debug, error, info, trace, warn};

use crate::error::{RenderError, VkResultExt};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance, optional validation messenger, and the window surface.
///
/// Outlives the logical device. `destroy` tears down messenger, surface,
/// then instance.
pub struct InstanceContext {
    pub(crate) instance: ash::Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub(crate) surface_loader: surface::Instance,
    pub(crate) surface: vk::SurfaceKHR,
}

/// Names in `required` that do not appear in `available`, in request order.
pub fn missing_names<'a>(required: &[&'a CStr], available: &[&CStr]) -> Vec<&'a CStr> {
    required
        .iter()
        .copied()
        .filter(|r| !available.contains(r))
        .collect()
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    use vk::DebugUtilsMessageSeverityFlagsEXT as S;
    if severity.contains(S::ERROR) {
        error!(target: "vulkan", "{types:?}: {msg}");
    } else if severity.contains(S::WARNING) {
        warn!(target: "vulkan", "{types:?}: {msg}");
    } else if severity.contains(S::INFO) {
        info!(target: "vulkan", "{types:?}: {msg}");
    } else {
        trace!(target: "vulkan", "{types:?}: {msg}");
    }
    vk::FALSE
}

fn messenger_info<'a>() -> vk::DebugUtilsMessengerCreateInfoEXT<'a> {
    vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    }
}

unsafe fn check_validation_layer(entry: &Entry) -> Result<()> {
    let layers = entry
        .enumerate_instance_layer_properties()
        .op("enumerate_instance_layer_properties")?;
    let found = layers
        .iter()
        .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER);
    if !found {
        return Err(RenderError::ValidationLayerUnavailable(
            VALIDATION_LAYER.to_string_lossy().into_owned(),
        )
        .into());
    }
    Ok(())
}

unsafe fn check_extensions(entry: &Entry, required: &[*const c_char]) -> Result<()> {
    let props = entry
        .enumerate_instance_extension_properties(None)
        .op("enumerate_instance_extension_properties")?;
    let available: Vec<&CStr> = props
        .iter()
        .map(|p| CStr::from_ptr(p.extension_name.as_ptr()))
        .collect();
    debug!("available instance extensions: {available:?}");

    let required: Vec<&CStr> = required.iter().map(|&p| CStr::from_ptr(p)).collect();
    let missing = missing_names(&required, &available);
    if !missing.is_empty() {
        return Err(RenderError::MissingInstanceExtensions(
            missing
                .iter()
                .map(|m| m.to_string_lossy().into_owned())
                .collect(),
        )
        .into());
    }
    Ok(())
}

impl InstanceContext {
    pub unsafe fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        validation: bool,
    ) -> Result<Self> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();

        let entry = Entry::linked();

        let mut extensions = ash_window::enumerate_required_extensions(dh)
            .op("enumerate_required_extensions")?
            .to_vec();
        if validation {
            extensions.push(debug_utils::NAME.as_ptr());
            check_validation_layer(&entry)?;
        }
        check_extensions(&entry, &extensions)?;

        let app_info = vk::ApplicationInfo {
            s_type: vk::StructureType::APPLICATION_INFO,
            p_application_name: c"tessera".as_ptr(),
            application_version: vk::make_api_version(0, 0, 1, 0),
            p_engine_name: c"tessera".as_ptr(),
            engine_version: vk::make_api_version(0, 0, 1, 0),
            api_version: vk::API_VERSION_1_0,
            ..Default::default()
        };

        let layers = [VALIDATION_LAYER.as_ptr()];
        // Chained so instance creation and destruction are reported too.
        let mut early_messenger = messenger_info();
        let mut create_info = vk::InstanceCreateInfo {
            s_type: vk::StructureType::INSTANCE_CREATE_INFO,
            p_application_info: &app_info,
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            ..Default::default()
        };
        if validation {
            create_info.enabled_layer_count = layers.len() as u32;
            create_info.pp_enabled_layer_names = layers.as_ptr();
            create_info = create_info.push_next(&mut early_messenger);
        }

        let instance = entry
            .create_instance(&create_info, None)
            .op("create_instance")?;
        info!(
            "vulkan instance created ({} extensions, validation={validation})",
            extensions.len()
        );

        let debug = if validation {
            let loader = debug_utils::Instance::new(&entry, &instance);
            match loader.create_debug_utils_messenger(&messenger_info(), None) {
                Ok(m) => Some((loader, m)),
                Err(code) => {
                    instance.destroy_instance(None);
                    return Err(RenderError::Vulkan {
                        op: "create_debug_utils_messenger",
                        code,
                    }
                    .into());
                }
            }
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = match ash_window::create_surface(&entry, &instance, dh, wh, None) {
            Ok(s) => s,
            Err(code) => {
                if let Some((loader, m)) = &debug {
                    loader.destroy_debug_utils_messenger(*m, None);
                }
                instance.destroy_instance(None);
                return Err(RenderError::Vulkan {
                    op: "create_surface",
                    code,
                })
                .context("ash_window::create_surface");
            }
        };

        Ok(Self {
            instance,
            debug,
            surface_loader,
            surface,
        })
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Call only after every device-level object is gone.
    pub unsafe fn destroy(&mut self) {
        if let Some((loader, m)) = self.debug.take() {
            loader.destroy_debug_utils_messenger(m, None);
        }
        self.surface_loader.destroy_surface(self.surface, None);
        self.instance.destroy_instance(None);
    }
}
