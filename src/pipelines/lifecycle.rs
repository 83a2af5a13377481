// SPDX-License-Identifier: GPL-3.0-only

//! Component lifecycle
//!
//! Components are created in a fixed order (camera, preview, video encoder,
//! then the still encoder on first use) and destroyed in exactly the reverse
//! order. Formats are committed while a component is disabled; enabling the
//! camera pushes the full tuning set through the camera control collaborator.

use super::graph::ConnectionGraph;
use crate::backends::HardwareBackend;
use crate::backends::camera_control::{CameraControl, CameraParameters};
use crate::backends::types::*;
use crate::config::{CaptureConfig, PipelineConfig, PreviewParameters, StillConfig};
use crate::constants::*;
use crate::errors::SetupError;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle state of a hardware component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComponentState {
    Uncreated,
    Created,
    Enabled,
    Disabled,
    Destroyed,
}

/// A live component and where it is in its lifecycle
#[derive(Debug, Clone)]
pub struct Component {
    pub handle: ComponentHandle,
    pub state: ComponentState,
}

/// Owns every hardware component of one pipeline
pub struct LifecycleManager {
    /// Live components in creation order
    components: Vec<Component>,
    retired: Vec<ComponentKind>,
    camera_control: Arc<dyn CameraControl>,
    camera_params: CameraParameters,
    control_callback: Arc<dyn PortCallback>,
}

impl LifecycleManager {
    /// # Arguments
    ///
    /// * `camera_control` - Applies `camera_params` each time the camera is enabled
    /// * `control_callback` - Handler for events on the camera control port
    pub fn new(
        camera_control: Arc<dyn CameraControl>,
        camera_params: CameraParameters,
        control_callback: Arc<dyn PortCallback>,
    ) -> Self {
        Self {
            components: Vec::new(),
            retired: Vec::new(),
            camera_control,
            camera_params,
            control_callback,
        }
    }

    pub fn camera_control(&self) -> &Arc<dyn CameraControl> {
        &self.camera_control
    }

    pub fn camera_parameters(&self) -> &CameraParameters {
        &self.camera_params
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn handle(&self, kind: ComponentKind) -> Option<&ComponentHandle> {
        self.components
            .iter()
            .find(|c| c.handle.kind == kind)
            .map(|c| &c.handle)
    }

    pub fn state(&self, kind: ComponentKind) -> ComponentState {
        if let Some(c) = self.components.iter().find(|c| c.handle.kind == kind) {
            c.state
        } else if self.retired.contains(&kind) {
            ComponentState::Destroyed
        } else {
            ComponentState::Uncreated
        }
    }

    fn find_mut(&mut self, kind: ComponentKind) -> Result<&mut Component, SetupError> {
        let retired = self.retired.contains(&kind);
        self.components
            .iter_mut()
            .find(|c| c.handle.kind == kind)
            .ok_or(SetupError::InvalidState {
                kind,
                state: if retired {
                    ComponentState::Destroyed
                } else {
                    ComponentState::Uncreated
                },
                operation: "use",
            })
    }

    /// Create the next component in creation order
    pub fn create(
        &mut self,
        backend: &dyn HardwareBackend,
        kind: ComponentKind,
    ) -> Result<ComponentHandle, SetupError> {
        let expected = ComponentKind::CREATION_ORDER
            .get(self.components.len())
            .copied();
        if expected != Some(kind) {
            return Err(SetupError::OutOfOrder { kind, expected });
        }

        let handle = backend
            .create_component(kind)
            .map_err(|source| SetupError::ComponentCreate { kind, source })?;

        let (inputs, outputs) = match kind {
            ComponentKind::Camera => (0, CAMERA_CAPTURE_PORT + 1),
            ComponentKind::Preview => (1, 0),
            ComponentKind::VideoEncoder | ComponentKind::StillEncoder => (1, 1),
        };
        if handle.inputs.len() < inputs || handle.outputs.len() < outputs {
            discard_component(backend, &handle);
            return Err(SetupError::MissingPorts(kind));
        }

        if kind == ComponentKind::Camera {
            let control = handle.control;
            if let Err(source) = backend.enable_port(control, Arc::clone(&self.control_callback)) {
                discard_component(backend, &handle);
                return Err(SetupError::PortEnable {
                    port: control,
                    source,
                });
            }
        }

        info!(%kind, id = %handle.id, "Created component");
        self.components.push(Component {
            handle: handle.clone(),
            state: ComponentState::Created,
        });
        self.retired.retain(|k| *k != kind);
        Ok(handle)
    }

    /// Commit formats and set parameters; the component must be disabled
    pub fn configure(
        &mut self,
        backend: &dyn HardwareBackend,
        kind: ComponentKind,
        config: &CaptureConfig,
    ) -> Result<(), SetupError> {
        let component = self.find_mut(kind)?;
        if component.state == ComponentState::Enabled {
            return Err(SetupError::InvalidState {
                kind,
                state: component.state,
                operation: "configure",
            });
        }
        let handle = &component.handle;

        match kind {
            ComponentKind::Camera => configure_camera(backend, handle, &config.pipeline),
            ComponentKind::Preview => {
                configure_preview(backend, handle, &config.preview);
                Ok(())
            }
            ComponentKind::VideoEncoder => {
                configure_video_encoder(backend, handle, &config.pipeline)
            }
            ComponentKind::StillEncoder => configure_still_encoder(backend, handle, &config.still),
        }
    }

    pub fn enable(
        &mut self,
        backend: &dyn HardwareBackend,
        kind: ComponentKind,
    ) -> Result<(), SetupError> {
        let camera_control = Arc::clone(&self.camera_control);
        let camera_params = self.camera_params.clone();
        let component = self.find_mut(kind)?;
        if component.state == ComponentState::Enabled {
            return Err(SetupError::InvalidState {
                kind,
                state: component.state,
                operation: "enable",
            });
        }

        backend
            .enable_component(component.handle.id)
            .map_err(|source| SetupError::ComponentEnable { kind, source })?;
        component.state = ComponentState::Enabled;
        debug!(%kind, "Enabled component");

        if kind == ComponentKind::Camera {
            // The camera runs with whatever settings were accepted
            if let Err(e) = camera_control.apply_all(backend, component.handle.control, &camera_params)
            {
                warn!(error = %e, "Unable to apply all camera parameters");
            }
        }
        Ok(())
    }

    /// Disable a component, a no-op unless it is enabled
    pub fn disable(
        &mut self,
        backend: &dyn HardwareBackend,
        kind: ComponentKind,
    ) -> Result<(), SetupError> {
        let component = self.find_mut(kind)?;
        if component.state != ComponentState::Enabled {
            return Ok(());
        }
        backend.disable_component(component.handle.id)?;
        component.state = ComponentState::Disabled;
        debug!(%kind, "Disabled component");
        Ok(())
    }

    /// Destroy the newest component
    ///
    /// Rejected while any of its ports is bound in `graph`.
    pub fn destroy(
        &mut self,
        backend: &dyn HardwareBackend,
        kind: ComponentKind,
        graph: &ConnectionGraph,
    ) -> Result<(), SetupError> {
        let newest = self.components.last().map(|c| c.handle.kind);
        if newest != Some(kind) {
            if self.handle(kind).is_none() {
                return Err(SetupError::InvalidState {
                    kind,
                    state: self.state(kind),
                    operation: "destroy",
                });
            }
            return Err(SetupError::OutOfOrder {
                kind,
                expected: newest,
            });
        }
        let Some(component) = self.components.last() else {
            return Err(SetupError::Pipeline("destroy"));
        };
        let id = component.handle.id;
        if graph.is_component_bound(id) {
            return Err(SetupError::ComponentBound(kind));
        }

        self.disable(backend, kind)?;
        if kind == ComponentKind::Camera {
            if let Err(e) = backend.disable_port(PortId::control(id)) {
                warn!(error = %e, "Unable to disable camera control port");
            }
        }
        backend.destroy_component(id)?;

        self.components.pop();
        self.retired.push(kind);
        info!(%kind, "Destroyed component");
        Ok(())
    }

    /// Disable everything, then destroy everything, newest first
    ///
    /// Keeps going after a failure and reports the first error.
    pub fn teardown_all(
        &mut self,
        backend: &dyn HardwareBackend,
        graph: &ConnectionGraph,
    ) -> Result<(), SetupError> {
        let mut first_error = None;

        let kinds: Vec<ComponentKind> = self.components.iter().rev().map(|c| c.handle.kind).collect();
        for kind in &kinds {
            if let Err(e) = self.disable(backend, *kind) {
                warn!(%kind, error = %e, "Failed to disable component");
                first_error.get_or_insert(e);
            }
        }

        for kind in kinds {
            if let Err(e) = self.destroy(backend, kind, graph) {
                warn!(%kind, error = %e, "Failed to destroy component");
                // Forget it so the rest can go
                self.components.pop();
                self.retired.push(kind);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Best effort destroy of a component that never made it into the manager
fn discard_component(backend: &dyn HardwareBackend, handle: &ComponentHandle) {
    if let Err(e) = backend.destroy_component(handle.id) {
        warn!(kind = %handle.kind, error = %e, "Unable to destroy rejected component");
    }
}

fn set_parameter(
    backend: &dyn HardwareBackend,
    port: PortId,
    parameter: PortParameter,
) -> Result<(), SetupError> {
    let name = parameter.name();
    backend
        .set_parameter(port, parameter)
        .map_err(|source| SetupError::Parameter { port, name, source })
}

fn commit(
    backend: &dyn HardwareBackend,
    port: PortId,
    format: &PortFormat,
) -> Result<(), SetupError> {
    backend
        .commit_format(port, format)
        .map_err(|source| SetupError::FormatCommit { port, source })
}

/// Opaque camera output at `config`'s size and rate
fn camera_video_format(config: &PipelineConfig) -> PortFormat {
    PortFormat {
        encoding_variant: Some(Encoding::I420),
        ..PortFormat::video(Encoding::Opaque, config.width, config.height, config.framerate)
    }
}

fn configure_camera(
    backend: &dyn HardwareBackend,
    handle: &ComponentHandle,
    config: &PipelineConfig,
) -> Result<(), SetupError> {
    let preview = handle.outputs[CAMERA_PREVIEW_PORT];
    let video = handle.outputs[CAMERA_VIDEO_PORT];
    let still = handle.outputs[CAMERA_CAPTURE_PORT];

    set_parameter(
        backend,
        handle.control,
        PortParameter::CameraConfig(CameraConfigParams {
            max_stills_w: MAX_STILLS_WIDTH,
            max_stills_h: MAX_STILLS_HEIGHT,
            stills_yuv422: false,
            one_shot_stills: true,
            max_preview_video_w: config.width,
            max_preview_video_h: config.height,
            num_preview_video_frames: NUM_PREVIEW_VIDEO_FRAMES,
            stills_capture_circular_buffer_height: 0,
            fast_preview_resume: false,
            use_stc_timestamp: TimestampMode::ResetStc,
        }),
    )?;

    commit(backend, preview, &camera_video_format(config))?;

    let video_info = backend.port_info(video)?;
    let video_format = PortFormat {
        buffer_num: video_info.preferred_buffer_num().max(MIN_CAMERA_OUTPUT_BUFFERS),
        ..camera_video_format(config)
    };
    commit(backend, video, &video_format)?;

    let still_info = backend.port_info(still)?;
    let still_format = PortFormat {
        encoding: Encoding::Opaque,
        encoding_variant: Some(Encoding::I420),
        width: align_up(MAX_STILLS_WIDTH, 32),
        height: align_up(MAX_STILLS_HEIGHT, 16),
        crop: Rect {
            x: 0,
            y: 0,
            width: MAX_STILLS_WIDTH,
            height: MAX_STILLS_HEIGHT,
        },
        framerate: Framerate::new(0, 1),
        bitrate: 0,
        buffer_num: still_info.preferred_buffer_num().max(MIN_CAMERA_OUTPUT_BUFFERS),
        buffer_size: 0,
    };
    commit(backend, still, &still_format)?;

    info!(
        width = config.width,
        height = config.height,
        framerate = %config.framerate,
        "Configured camera"
    );
    Ok(())
}

fn configure_preview(
    backend: &dyn HardwareBackend,
    handle: &ComponentHandle,
    preview: &PreviewParameters,
) {
    if !preview.want_preview {
        debug!("Preview disabled, renderer acts as a null sink");
        return;
    }
    if let Err(e) = set_parameter(
        backend,
        handle.inputs[0],
        PortParameter::DisplayRegion(preview.clone()),
    ) {
        warn!(error = %e, "Unable to set preview display region");
    }
}

fn configure_video_encoder(
    backend: &dyn HardwareBackend,
    handle: &ComponentHandle,
    config: &PipelineConfig,
) -> Result<(), SetupError> {
    let input = handle.inputs[0];
    let output = handle.outputs[0];

    let info = backend.port_info(output)?;
    let format = PortFormat {
        bitrate: config.bitrate,
        buffer_num: info.preferred_buffer_num(),
        buffer_size: info.preferred_buffer_size(),
        ..PortFormat::video(Encoding::H264, config.width, config.height, config.framerate)
    };
    commit(backend, output, &format)?;

    if config.intra_period != 0 {
        set_parameter(backend, output, PortParameter::IntraPeriod(config.intra_period))?;
    }
    set_parameter(
        backend,
        output,
        PortParameter::VideoProfile {
            profile: config.profile,
            level: H264Level::Level4,
        },
    )?;

    if let Err(e) = set_parameter(
        backend,
        input,
        PortParameter::ImmutableInput(config.immutable_input),
    ) {
        warn!(error = %e, "Unable to set immutable input flag");
    }

    info!(
        bitrate = config.bitrate,
        profile = %config.profile,
        intra_period = config.intra_period,
        "Configured video encoder"
    );
    Ok(())
}

fn configure_still_encoder(
    backend: &dyn HardwareBackend,
    handle: &ComponentHandle,
    config: &StillConfig,
) -> Result<(), SetupError> {
    let output = handle.outputs[0];

    let info = backend.port_info(output)?;
    let format = PortFormat {
        buffer_num: info.preferred_buffer_num(),
        buffer_size: info.preferred_buffer_size(),
        ..PortFormat::video(
            Encoding::Jpeg,
            MAX_STILLS_WIDTH,
            MAX_STILLS_HEIGHT,
            Framerate::new(0, 1),
        )
    };
    commit(backend, output, &format)?;

    set_parameter(backend, output, PortParameter::JpegQuality(config.jpeg_quality))?;

    if let Err(e) = set_parameter(
        backend,
        handle.control,
        PortParameter::Thumbnail(config.thumbnail),
    ) {
        warn!(error = %e, "Unable to set thumbnail configuration");
    }

    debug!(quality = config.jpeg_quality, "Configured still encoder");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::DefaultCameraControl;
    use crate::backends::simulated::{Fault, SimulatedBackend};
    use crate::pipelines::dispatcher::ControlEventHandler;

    fn manager() -> LifecycleManager {
        LifecycleManager::new(
            Arc::new(DefaultCameraControl),
            CameraParameters::default(),
            Arc::new(ControlEventHandler),
        )
    }

    #[test]
    fn test_creation_order_enforced() {
        let backend = SimulatedBackend::default();
        let mut lifecycle = manager();

        assert!(matches!(
            lifecycle.create(&backend, ComponentKind::Preview),
            Err(SetupError::OutOfOrder {
                expected: Some(ComponentKind::Camera),
                ..
            })
        ));
        lifecycle.create(&backend, ComponentKind::Camera).unwrap();
        lifecycle.create(&backend, ComponentKind::Preview).unwrap();
        assert_eq!(lifecycle.state(ComponentKind::Preview), ComponentState::Created);
        assert_eq!(
            lifecycle.state(ComponentKind::StillEncoder),
            ComponentState::Uncreated
        );
    }

    #[test]
    fn test_configure_rejected_when_enabled() {
        let backend = SimulatedBackend::default();
        let mut lifecycle = manager();
        let config = CaptureConfig::default();

        lifecycle.create(&backend, ComponentKind::Camera).unwrap();
        lifecycle
            .configure(&backend, ComponentKind::Camera, &config)
            .unwrap();
        lifecycle.enable(&backend, ComponentKind::Camera).unwrap();
        assert!(matches!(
            lifecycle.configure(&backend, ComponentKind::Camera, &config),
            Err(SetupError::InvalidState {
                operation: "configure",
                ..
            })
        ));
    }

    #[test]
    fn test_camera_ports_committed() {
        let backend = SimulatedBackend::default();
        let mut lifecycle = manager();
        let handle = lifecycle.create(&backend, ComponentKind::Camera).unwrap();
        lifecycle
            .configure(&backend, ComponentKind::Camera, &CaptureConfig::default())
            .unwrap();

        let video = backend
            .port_info(handle.outputs[CAMERA_VIDEO_PORT])
            .unwrap()
            .format
            .unwrap();
        assert_eq!((video.width, video.height), (1920, 1080));
        assert!(video.buffer_num >= MIN_CAMERA_OUTPUT_BUFFERS);

        let still = backend
            .port_info(handle.outputs[CAMERA_CAPTURE_PORT])
            .unwrap()
            .format
            .unwrap();
        assert_eq!((still.width, still.height), (2592, 1952));
        assert_eq!(still.crop.height, 1944);
        assert_eq!(still.framerate.num, 0);
    }

    #[test]
    fn test_camera_enable_applies_tuning() {
        let backend = SimulatedBackend::default();
        let mut lifecycle = manager();
        let handle = lifecycle.create(&backend, ComponentKind::Camera).unwrap();
        lifecycle
            .configure(&backend, ComponentKind::Camera, &CaptureConfig::default())
            .unwrap();
        lifecycle.enable(&backend, ComponentKind::Camera).unwrap();

        let tuning = backend
            .parameters(handle.control)
            .into_iter()
            .filter(|p| matches!(p, PortParameter::Tuning(_)))
            .count();
        assert_eq!(tuning, 17);
    }

    #[test]
    fn test_intra_period_only_when_set() {
        let backend = SimulatedBackend::default();
        let mut lifecycle = manager();
        let mut config = CaptureConfig::default();
        lifecycle.create(&backend, ComponentKind::Camera).unwrap();
        lifecycle.create(&backend, ComponentKind::Preview).unwrap();
        let encoder = lifecycle
            .create(&backend, ComponentKind::VideoEncoder)
            .unwrap();

        lifecycle
            .configure(&backend, ComponentKind::VideoEncoder, &config)
            .unwrap();
        let has_intra = |backend: &SimulatedBackend| {
            backend
                .parameters(encoder.outputs[0])
                .iter()
                .any(|p| matches!(p, PortParameter::IntraPeriod(_)))
        };
        assert!(!has_intra(&backend));

        config.pipeline.intra_period = 15;
        lifecycle
            .configure(&backend, ComponentKind::VideoEncoder, &config)
            .unwrap();
        assert!(has_intra(&backend));
    }

    #[test]
    fn test_immutable_input_failure_not_fatal() {
        let backend = SimulatedBackend::default();
        let mut lifecycle = manager();
        lifecycle.create(&backend, ComponentKind::Camera).unwrap();
        lifecycle.create(&backend, ComponentKind::Preview).unwrap();
        lifecycle
            .create(&backend, ComponentKind::VideoEncoder)
            .unwrap();

        backend.inject(Fault::RejectParameter("immutable input flag"));
        assert!(lifecycle
            .configure(&backend, ComponentKind::VideoEncoder, &CaptureConfig::default())
            .is_ok());

        backend.inject(Fault::RejectParameter("H264 profile"));
        assert!(matches!(
            lifecycle.configure(&backend, ComponentKind::VideoEncoder, &CaptureConfig::default()),
            Err(SetupError::Parameter {
                name: "H264 profile",
                ..
            })
        ));
    }

    #[test]
    fn test_destroy_order_and_bindings() {
        let backend = SimulatedBackend::default();
        let mut lifecycle = manager();
        let mut graph = ConnectionGraph::new();
        let camera = lifecycle.create(&backend, ComponentKind::Camera).unwrap();
        let preview = lifecycle.create(&backend, ComponentKind::Preview).unwrap();

        assert!(matches!(
            lifecycle.destroy(&backend, ComponentKind::Camera, &graph),
            Err(SetupError::OutOfOrder { .. })
        ));

        let id = graph
            .connect(
                &backend,
                camera.outputs[CAMERA_PREVIEW_PORT],
                preview.inputs[0],
                crate::pipelines::graph::tunnel_flags(),
            )
            .unwrap();
        assert!(matches!(
            lifecycle.destroy(&backend, ComponentKind::Preview, &graph),
            Err(SetupError::ComponentBound(ComponentKind::Preview))
        ));

        graph.disconnect(&backend, id).unwrap();
        lifecycle.teardown_all(&backend, &graph).unwrap();
        assert!(backend.live_components().is_empty());
        assert_eq!(lifecycle.state(ComponentKind::Camera), ComponentState::Destroyed);
    }
}
