//! The shader program that samples the source texture during the blit.

use std::ffi::CStr;
use std::sync::Arc;

use glvk_procs::ffi::{GLchar, GLenum, GLint, GLsizei, GLuint, GL_TEXTURE_EXTERNAL_OES};
use glvk_procs::ProcTable;
use tracing::{debug, error};

use crate::error::{InteropError, ShaderStage};

/// Full-screen quad with texture coordinates passed through.
pub const VERTEX_SHADER: &str = r#"#version 100
attribute vec2 aPosition;
attribute vec2 aTexCoord;
varying vec2 vTexCoord;

void main() {
    vTexCoord = aTexCoord;
    gl_Position = vec4(aPosition, 0.0, 1.0);
}
"#;

/// Straight copy out of an external (`samplerExternalOES`) texture.
pub const EXTERNAL_OES_FRAGMENT_SHADER: &str = r#"#version 100
#extension GL_OES_EGL_image_external : require
precision mediump float;
uniform samplerExternalOES uTexture;
varying vec2 vTexCoord;

void main() {
    gl_FragColor = texture2D(uTexture, vTexCoord);
}
"#;

pub const POSITION_LOCATION: GLuint = 0;
pub const TEXTURE_COORDS_LOCATION: GLuint = 1;

const POSITION_ATTRIBUTE: &CStr = c"aPosition";
const TEXTURE_COORDS_ATTRIBUTE: &CStr = c"aTexCoord";
const SAMPLER_UNIFORM: &CStr = c"uTexture";

/// Which inputs a program variant reads besides the vertex position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramInputs {
    pub texture_coords: bool,
    pub sampler: bool,
}

impl Default for ProgramInputs {
    fn default() -> Self {
        Self {
            texture_coords: true,
            sampler: true,
        }
    }
}

/// A linked GL program plus the locations of its inputs.
///
/// Owned by the [`crate::Trampoline`]; deleted on drop, which must happen
/// with the bridging context current.
pub struct ConversionProgram {
    gl: Arc<ProcTable>,
    program: GLuint,
    source_target: GLenum,
    texture_coords: Option<GLuint>,
    sampler: Option<GLint>,
}

impl ConversionProgram {
    /// The program used by the bridge: samples a `GL_TEXTURE_EXTERNAL_OES`
    /// texture across the whole destination.
    pub fn external_oes(gl: &Arc<ProcTable>) -> Result<Self, InteropError> {
        Self::compile(
            gl,
            VERTEX_SHADER,
            EXTERNAL_OES_FRAGMENT_SHADER,
            GL_TEXTURE_EXTERNAL_OES,
            ProgramInputs::default(),
        )
    }

    /// Compile and link a program from source.
    ///
    /// Attribute locations are bound before linking, so only the sampler
    /// uniform is queried afterwards. Inputs the variant does not read are
    /// not required to be active.
    pub fn compile(
        gl: &Arc<ProcTable>,
        vertex_source: &str,
        fragment_source: &str,
        source_target: GLenum,
        inputs: ProgramInputs,
    ) -> Result<Self, InteropError> {
        let vertex = compile_shader(gl, gl::VERTEX_SHADER, vertex_source, ShaderStage::Vertex)?;
        let fragment =
            match compile_shader(gl, gl::FRAGMENT_SHADER, fragment_source, ShaderStage::Fragment) {
                Ok(shader) => shader,
                Err(err) => {
                    unsafe { gl.delete_shader.call(|f| f(vertex)) };
                    return Err(err);
                }
            };

        let program = unsafe { gl.create_program.call(|f| f()) };
        unsafe {
            gl.attach_shader.call(|f| f(program, vertex));
            gl.attach_shader.call(|f| f(program, fragment));
            gl.bind_attrib_location
                .call(|f| f(program, POSITION_LOCATION, POSITION_ATTRIBUTE.as_ptr()));
            if inputs.texture_coords {
                gl.bind_attrib_location.call(|f| {
                    f(
                        program,
                        TEXTURE_COORDS_LOCATION,
                        TEXTURE_COORDS_ATTRIBUTE.as_ptr(),
                    )
                });
            }
            gl.link_program.call(|f| f(program));

            // Attached shaders live on until the program is deleted.
            gl.delete_shader.call(|f| f(vertex));
            gl.delete_shader.call(|f| f(fragment));
        }

        let mut linked = 0;
        unsafe { gl.get_programiv.call(|f| f(program, gl::LINK_STATUS, &mut linked)) };
        if linked == 0 {
            let log = program_info_log(gl, program);
            error!("Could not link conversion program: {log}");
            unsafe { gl.delete_program.call(|f| f(program)) };
            return Err(InteropError::CompileLinkFailure {
                stage: ShaderStage::Program,
                log,
            });
        }

        let sampler = if inputs.sampler {
            let location = unsafe {
                gl.get_uniform_location
                    .call(|f| f(program, SAMPLER_UNIFORM.as_ptr()))
            };
            if location < 0 {
                error!("Conversion program has no active {SAMPLER_UNIFORM:?} uniform");
                unsafe { gl.delete_program.call(|f| f(program)) };
                return Err(InteropError::CompileLinkFailure {
                    stage: ShaderStage::Program,
                    log: format!("uniform {SAMPLER_UNIFORM:?} is not active"),
                });
            }
            Some(location)
        } else {
            None
        };

        debug!(program, "Linked conversion program");

        Ok(Self {
            gl: Arc::clone(gl),
            program,
            source_target,
            texture_coords: inputs.texture_coords.then_some(TEXTURE_COORDS_LOCATION),
            sampler,
        })
    }

    pub fn program(&self) -> GLuint {
        self.program
    }

    /// Texture target the sampler reads from.
    pub fn source_target(&self) -> GLenum {
        self.source_target
    }

    pub fn position_location(&self) -> GLuint {
        POSITION_LOCATION
    }

    pub fn texture_coords_location(&self) -> Option<GLuint> {
        self.texture_coords
    }

    pub fn sampler_location(&self) -> Option<GLint> {
        self.sampler
    }

    /// Forget the GL name without deleting it, for when the owning context
    /// is gone.
    pub(crate) fn abandon(mut self) {
        self.program = 0;
    }
}

impl Drop for ConversionProgram {
    fn drop(&mut self) {
        if self.program != 0 {
            unsafe { self.gl.delete_program.call(|f| f(self.program)) };
        }
    }
}

fn compile_shader(
    gl: &ProcTable,
    kind: GLenum,
    source: &str,
    stage: ShaderStage,
) -> Result<GLuint, InteropError> {
    let shader = unsafe { gl.create_shader.call(|f| f(kind)) };
    let source_ptr = source.as_ptr().cast::<GLchar>();
    let source_len = source.len() as GLint;
    unsafe {
        gl.shader_source
            .call(|f| f(shader, 1, &source_ptr, &source_len));
        gl.compile_shader.call(|f| f(shader));
    }

    let mut compiled = 0;
    unsafe { gl.get_shaderiv.call(|f| f(shader, gl::COMPILE_STATUS, &mut compiled)) };
    if compiled == 0 {
        let log = shader_info_log(gl, shader);
        error!("Could not compile {stage}: {log}");
        unsafe { gl.delete_shader.call(|f| f(shader)) };
        return Err(InteropError::CompileLinkFailure { stage, log });
    }
    Ok(shader)
}

fn shader_info_log(gl: &ProcTable, shader: GLuint) -> String {
    let mut length = 0;
    unsafe { gl.get_shaderiv.call(|f| f(shader, gl::INFO_LOG_LENGTH, &mut length)) };
    read_info_log(length, |capacity, written, buffer| unsafe {
        gl.get_shader_info_log
            .call(|f| f(shader, capacity, written, buffer))
    })
}

fn program_info_log(gl: &ProcTable, program: GLuint) -> String {
    let mut length = 0;
    unsafe { gl.get_programiv.call(|f| f(program, gl::INFO_LOG_LENGTH, &mut length)) };
    read_info_log(length, |capacity, written, buffer| unsafe {
        gl.get_program_info_log
            .call(|f| f(program, capacity, written, buffer))
    })
}

fn read_info_log(
    length: GLint,
    read: impl FnOnce(GLsizei, *mut GLsizei, *mut GLchar),
) -> String {
    if length <= 0 {
        return String::from("(no info log)");
    }
    let mut buffer = vec![0u8; length as usize];
    let mut written: GLsizei = 0;
    read(length, &mut written, buffer.as_mut_ptr().cast());
    buffer.truncate(written.clamp(0, length) as usize);
    String::from_utf8_lossy(&buffer).into_owned()
}
