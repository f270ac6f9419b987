//! GL side of the bridge: resolved entry points plus the textured-quad blit.

use std::sync::Arc;

use glvk_procs::ffi::{GLfloat, GLsizei, GLuint, ResolverFn};
use glvk_procs::{ProcDebugOptions, ProcTable};
use tracing::error;

use crate::bridge::TextureSize;
use crate::error::InteropError;
use crate::program::ConversionProgram;

/// Triangle-strip quad covering the whole viewport.
static QUAD_POSITIONS: [GLfloat; 8] = [-1.0, -1.0, 1.0, -1.0, -1.0, 1.0, 1.0, 1.0];
static QUAD_TEXTURE_COORDS: [GLfloat; 8] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0];

/// Capabilities switched off for the blit so nothing but the sampled texel
/// reaches the destination.
const BLIT_DISABLED_CAPS: [u32; 5] = [
    gl::BLEND,
    gl::SCISSOR_TEST,
    gl::DEPTH_TEST,
    gl::STENCIL_TEST,
    gl::CULL_FACE,
];

/// Set once while the trampoline is built and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Valid,
    Invalid,
}

/// Owns the GL entry points and conversion program of one bridging context.
///
/// Must be created, used and dropped with that context current.
pub struct Trampoline {
    gl: Arc<ProcTable>,
    program: Option<ConversionProgram>,
    state: BridgeState,
    failure: Option<InteropError>,
}

impl Trampoline {
    /// Resolve the proc table through `resolver` and build the conversion
    /// program. Failures are logged and leave the trampoline invalid.
    pub fn new(resolver: &ResolverFn<'_>, options: ProcDebugOptions) -> Self {
        let mut trampoline = Self {
            gl: Arc::new(ProcTable::new(resolver, options)),
            program: None,
            state: BridgeState::Uninitialized,
            failure: None,
        };

        if !trampoline.gl.is_valid() {
            let missing = trampoline.gl.missing_required();
            error!(?missing, "Could not setup trampoline proc table.");
            trampoline.fail(InteropError::ResolutionFailure { missing });
            return trampoline;
        }

        match ConversionProgram::external_oes(&trampoline.gl) {
            Ok(program) => {
                trampoline.program = Some(program);
                trampoline.state = BridgeState::Valid;
            }
            Err(err) => {
                error!("Could not create trampoline program: {err}");
                trampoline.fail(err);
            }
        }
        trampoline
    }

    fn fail(&mut self, err: InteropError) {
        self.state = BridgeState::Invalid;
        self.failure = Some(err);
    }

    pub fn is_valid(&self) -> bool {
        self.state == BridgeState::Valid
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Why construction failed, if it did.
    pub fn failure(&self) -> Option<&InteropError> {
        self.failure.as_ref()
    }

    pub fn proc_table(&self) -> &Arc<ProcTable> {
        &self.gl
    }

    /// Draw `from` (sampled through the program's source target) over all
    /// of `to`, a 2D texture of `size`, and wait for GL to finish.
    pub fn copy_texture(
        &self,
        from: GLuint,
        to: GLuint,
        size: TextureSize,
    ) -> Result<(), InteropError> {
        let Some(program) = self.program.as_ref().filter(|_| self.is_valid()) else {
            return Err(InteropError::InvalidBridge);
        };
        let extent = size.gl_extent()?;
        let gl = &*self.gl;

        let mut framebuffer = 0;
        let status = unsafe {
            gl.gen_framebuffers.call(|f| f(1, &mut framebuffer));
            gl.bind_framebuffer
                .call(|f| f(gl::FRAMEBUFFER, framebuffer));
            gl.framebuffer_texture_2d.call(|f| {
                f(gl::FRAMEBUFFER, gl::COLOR_ATTACHMENT0, gl::TEXTURE_2D, to, 0)
            });
            gl.check_framebuffer_status.call(|f| f(gl::FRAMEBUFFER))
        };

        let result = if status == gl::FRAMEBUFFER_COMPLETE {
            unsafe { draw_quad(gl, program, from, extent) };
            Ok(())
        } else {
            error!("Blit framebuffer is incomplete (status {status:#06x})");
            Err(InteropError::IncompleteFramebuffer(status))
        };

        unsafe {
            gl.bind_framebuffer.call(|f| f(gl::FRAMEBUFFER, 0));
            gl.delete_framebuffers.call(|f| f(1, &framebuffer));
        }
        result
    }

    /// Drop without issuing GL deletes, for when the context is gone.
    pub fn abandon(mut self) {
        if let Some(program) = self.program.take() {
            program.abandon();
        }
    }
}

/// # Safety
///
/// A framebuffer with a complete color attachment must be bound.
unsafe fn draw_quad(
    gl: &ProcTable,
    program: &ConversionProgram,
    from: GLuint,
    (width, height): (GLsizei, GLsizei),
) {
    let position = program.position_location();
    let source_target = program.source_target();

    gl.viewport.call(|f| f(0, 0, width, height));
    for cap in BLIT_DISABLED_CAPS {
        gl.disable.call(|f| f(cap));
    }
    gl.color_mask
        .call(|f| f(gl::TRUE, gl::TRUE, gl::TRUE, gl::TRUE));
    gl.clear_color.call(|f| f(0.0, 0.0, 0.0, 0.0));
    gl.clear.call(|f| f(gl::COLOR_BUFFER_BIT));

    gl.use_program.call(|f| f(program.program()));
    gl.active_texture.call(|f| f(gl::TEXTURE0));
    gl.bind_texture.call(|f| f(source_target, from));
    for (parameter, value) in [
        (gl::TEXTURE_MIN_FILTER, gl::LINEAR),
        (gl::TEXTURE_MAG_FILTER, gl::LINEAR),
        (gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE),
        (gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE),
    ] {
        gl.tex_parameteri
            .call(|f| f(source_target, parameter, value as i32));
    }
    if let Some(sampler) = program.sampler_location() {
        gl.uniform_1i.call(|f| f(sampler, 0));
    }

    // Client-side vertex arrays.
    gl.bind_buffer.call(|f| f(gl::ARRAY_BUFFER, 0));
    gl.enable_vertex_attrib_array.call(|f| f(position));
    gl.vertex_attrib_pointer.call(|f| {
        f(position, 2, gl::FLOAT, gl::FALSE, 0, QUAD_POSITIONS.as_ptr().cast())
    });
    if let Some(texture_coords) = program.texture_coords_location() {
        gl.enable_vertex_attrib_array.call(|f| f(texture_coords));
        gl.vertex_attrib_pointer.call(|f| {
            f(
                texture_coords,
                2,
                gl::FLOAT,
                gl::FALSE,
                0,
                QUAD_TEXTURE_COORDS.as_ptr().cast(),
            )
        });
    }

    gl.draw_arrays.call(|f| f(gl::TRIANGLE_STRIP, 0, 4));

    gl.disable_vertex_attrib_array.call(|f| f(position));
    if let Some(texture_coords) = program.texture_coords_location() {
        gl.disable_vertex_attrib_array.call(|f| f(texture_coords));
    }
    gl.bind_texture.call(|f| f(source_target, 0));
    gl.use_program.call(|f| f(0));

    // Vulkan reads the destination right after; GL must be done writing it.
    gl.finish.call(|f| f());
}

#[cfg(test)]
mod tests {
    use super::*;
    use glvk_procs::mock::MockGl;

    fn trampoline(mock: &MockGl) -> Trampoline {
        Trampoline::new(&mock.resolver(), ProcDebugOptions::default())
    }

    #[test]
    fn valid_with_full_driver() {
        let mock = MockGl::install();
        let trampoline = trampoline(&mock);
        assert!(trampoline.is_valid());
        assert_eq!(trampoline.state(), BridgeState::Valid);
        assert!(trampoline.failure().is_none());
    }

    #[test]
    fn missing_entry_point_invalidates() {
        let mock = MockGl::install();
        let trampoline = Trampoline::new(
            &mock.resolver_without(&["glImportMemoryFdEXT"]),
            ProcDebugOptions::default(),
        );
        assert_eq!(trampoline.state(), BridgeState::Invalid);
        assert_eq!(
            trampoline.failure(),
            Some(&InteropError::ResolutionFailure {
                missing: vec!["glImportMemoryFdEXT"]
            })
        );
        // Nothing was compiled against a half-resolved table.
        assert_eq!(mock.call_count("glCreateShader"), 0);
        assert_eq!(
            trampoline.copy_texture(1, 2, TextureSize::new(4, 4)),
            Err(InteropError::InvalidBridge)
        );
    }

    #[test]
    fn program_failure_invalidates() {
        let mock = MockGl::install();
        mock.set_link_status(false);
        let trampoline = trampoline(&mock);
        assert!(!trampoline.is_valid());
        assert!(matches!(
            trampoline.failure(),
            Some(InteropError::CompileLinkFailure { .. })
        ));
    }

    #[test]
    fn copy_draws_one_quad_and_finishes() {
        let mock = MockGl::install();
        let trampoline = trampoline(&mock);
        mock.clear_calls();

        trampoline
            .copy_texture(7, 8, TextureSize::new(256, 128))
            .unwrap();

        let calls = mock.calls();
        let position = |name| calls.iter().position(|call| *call == name).unwrap();
        assert!(position("glCheckFramebufferStatus") < position("glDrawArrays"));
        assert!(position("glDrawArrays") < position("glFinish"));
        assert!(position("glFinish") < position("glDeleteFramebuffers"));
        assert_eq!(mock.call_count("glDrawArrays"), 1);
        assert_eq!(mock.live_framebuffers(), 0);
    }

    #[test]
    fn incomplete_framebuffer_fails_the_copy() {
        let mock = MockGl::install();
        let trampoline = trampoline(&mock);
        mock.set_framebuffer_status(gl::FRAMEBUFFER_INCOMPLETE_ATTACHMENT);

        assert_eq!(
            trampoline.copy_texture(7, 8, TextureSize::new(4, 4)),
            Err(InteropError::IncompleteFramebuffer(
                gl::FRAMEBUFFER_INCOMPLETE_ATTACHMENT
            ))
        );
        assert_eq!(mock.call_count("glDrawArrays"), 0);
        assert_eq!(mock.live_framebuffers(), 0);
    }

    #[test]
    fn oversized_copy_is_rejected_before_drawing() {
        let mock = MockGl::install();
        let trampoline = trampoline(&mock);
        mock.clear_calls();

        assert!(matches!(
            trampoline.copy_texture(7, 8, TextureSize::new(16, 1 << 31)),
            Err(InteropError::AllocationFailure(_))
        ));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn drop_deletes_program_unless_abandoned() {
        let mock = MockGl::install();
        drop(trampoline(&mock));
        assert_eq!(mock.live_programs(), 0);

        trampoline(&mock).abandon();
        assert_eq!(mock.live_programs(), 1);
    }
}
