//! A recording fake GL driver.
//!
//! [`MockGl::resolver`] hands out addresses of `extern "system"` functions
//! that record their name and keep just enough state (object names, shader
//! status, imported memory) for the bridge to run end to end without a GPU.
//! State is thread-local: each test thread sees its own driver.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::ffi::{c_void, CStr};
use std::marker::PhantomData;

use crate::ffi::*;

#[derive(Debug)]
struct MockState {
    calls: Vec<&'static str>,
    next_name: GLuint,
    errors: VecDeque<GLenum>,
    compile_ok: bool,
    link_ok: bool,
    info_log: String,
    missing_uniforms: bool,
    framebuffer_status: GLenum,
    textures: HashSet<GLuint>,
    framebuffers: HashSet<GLuint>,
    memory_objects: HashSet<GLuint>,
    programs: HashSet<GLuint>,
    shaders: HashSet<GLuint>,
    imported_fds: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            next_name: 1,
            errors: VecDeque::new(),
            compile_ok: true,
            link_ok: true,
            info_log: String::new(),
            missing_uniforms: false,
            framebuffer_status: gl::FRAMEBUFFER_COMPLETE,
            textures: HashSet::new(),
            framebuffers: HashSet::new(),
            memory_objects: HashSet::new(),
            programs: HashSet::new(),
            shaders: HashSet::new(),
            imported_fds: 0,
        }
    }
}

thread_local! {
    static STATE: RefCell<MockState> = RefCell::new(MockState::default());
}

fn with_state<R>(f: impl FnOnce(&mut MockState) -> R) -> R {
    STATE.with(|state| f(&mut state.borrow_mut()))
}

fn record(name: &'static str) {
    with_state(|state| state.calls.push(name));
}

fn next_name(state: &mut MockState) -> GLuint {
    let name = state.next_name;
    state.next_name += 1;
    name
}

unsafe fn gen_names(n: GLsizei, out: *mut GLuint, pick: fn(&mut MockState) -> &mut HashSet<GLuint>) {
    with_state(|state| {
        for i in 0..n.max(0) as usize {
            let name = next_name(state);
            pick(state).insert(name);
            *out.add(i) = name;
        }
    });
}

unsafe fn delete_names(
    n: GLsizei,
    names: *const GLuint,
    pick: fn(&mut MockState) -> &mut HashSet<GLuint>,
) {
    with_state(|state| {
        for i in 0..n.max(0) as usize {
            pick(state).remove(&*names.add(i));
        }
    });
}

unsafe fn write_log(log: &str, buf_size: GLsizei, length: *mut GLsizei, out: *mut GLchar) {
    let count = log.len().min((buf_size.max(1) - 1) as usize);
    std::ptr::copy_nonoverlapping(log.as_ptr().cast::<GLchar>(), out, count);
    *out.add(count) = 0;
    if !length.is_null() {
        *length = count as GLsizei;
    }
}

fn log_length(state: &MockState) -> GLint {
    if state.info_log.is_empty() {
        0
    } else {
        state.info_log.len() as GLint + 1
    }
}

macro_rules! recorded {
    ($( $fn_name:ident => $symbol:literal ($($arg:ident: $ty:ty),*); )*) => {
        $(
            unsafe extern "system" fn $fn_name($($arg: $ty),*) {
                $( let _ = $arg; )*
                record($symbol);
            }
        )*
    };
}

recorded! {
    active_texture => "glActiveTexture"(texture: GLenum);
    attach_shader => "glAttachShader"(program: GLuint, shader: GLuint);
    bind_attrib_location => "glBindAttribLocation"(program: GLuint, index: GLuint, name: *const GLchar);
    bind_buffer => "glBindBuffer"(target: GLenum, buffer: GLuint);
    bind_framebuffer => "glBindFramebuffer"(target: GLenum, framebuffer: GLuint);
    bind_texture => "glBindTexture"(target: GLenum, texture: GLuint);
    clear => "glClear"(mask: GLbitfield);
    clear_color => "glClearColor"(r: GLfloat, g: GLfloat, b: GLfloat, a: GLfloat);
    color_mask => "glColorMask"(r: GLboolean, g: GLboolean, b: GLboolean, a: GLboolean);
    compile_shader => "glCompileShader"(shader: GLuint);
    disable => "glDisable"(cap: GLenum);
    disable_vertex_attrib_array => "glDisableVertexAttribArray"(index: GLuint);
    draw_arrays => "glDrawArrays"(mode: GLenum, first: GLint, count: GLsizei);
    enable_vertex_attrib_array => "glEnableVertexAttribArray"(index: GLuint);
    finish => "glFinish"();
    framebuffer_texture_2d => "glFramebufferTexture2D"(target: GLenum, attachment: GLenum, textarget: GLenum, texture: GLuint, level: GLint);
    link_program => "glLinkProgram"(program: GLuint);
    shader_source => "glShaderSource"(shader: GLuint, count: GLsizei, string: *const *const GLchar, length: *const GLint);
    tex_parameteri => "glTexParameteri"(target: GLenum, pname: GLenum, param: GLint);
    tex_storage_mem_2d_ext => "glTexStorageMem2DEXT"(target: GLenum, levels: GLsizei, format: GLenum, width: GLsizei, height: GLsizei, memory: GLuint, offset: GLuint64);
    uniform_1i => "glUniform1i"(location: GLint, v0: GLint);
    use_program => "glUseProgram"(program: GLuint);
    vertex_attrib_pointer => "glVertexAttribPointer"(index: GLuint, size: GLint, type_: GLenum, normalized: GLboolean, stride: GLsizei, pointer: *const c_void);
    viewport => "glViewport"(x: GLint, y: GLint, width: GLsizei, height: GLsizei);
    object_label_khr => "glObjectLabelKHR"(identifier: GLenum, name: GLuint, length: GLsizei, label: *const GLchar);
    pop_debug_group_khr => "glPopDebugGroupKHR"();
    push_debug_group_khr => "glPushDebugGroupKHR"(source: GLenum, id: GLuint, length: GLsizei, message: *const GLchar);
}

unsafe extern "system" fn check_framebuffer_status(_target: GLenum) -> GLenum {
    record("glCheckFramebufferStatus");
    with_state(|state| state.framebuffer_status)
}

unsafe extern "system" fn create_memory_objects_ext(n: GLsizei, out: *mut GLuint) {
    record("glCreateMemoryObjectsEXT");
    gen_names(n, out, |state| &mut state.memory_objects);
}

unsafe extern "system" fn create_program() -> GLuint {
    record("glCreateProgram");
    with_state(|state| {
        let name = next_name(state);
        state.programs.insert(name);
        name
    })
}

unsafe extern "system" fn create_shader(_kind: GLenum) -> GLuint {
    record("glCreateShader");
    with_state(|state| {
        let name = next_name(state);
        state.shaders.insert(name);
        name
    })
}

unsafe extern "system" fn delete_framebuffers(n: GLsizei, names: *const GLuint) {
    record("glDeleteFramebuffers");
    delete_names(n, names, |state| &mut state.framebuffers);
}

unsafe extern "system" fn delete_memory_objects_ext(n: GLsizei, names: *const GLuint) {
    record("glDeleteMemoryObjectsEXT");
    delete_names(n, names, |state| &mut state.memory_objects);
}

unsafe extern "system" fn delete_program(program: GLuint) {
    record("glDeleteProgram");
    with_state(|state| state.programs.remove(&program));
}

unsafe extern "system" fn delete_shader(shader: GLuint) {
    record("glDeleteShader");
    with_state(|state| state.shaders.remove(&shader));
}

unsafe extern "system" fn delete_textures(n: GLsizei, names: *const GLuint) {
    record("glDeleteTextures");
    delete_names(n, names, |state| &mut state.textures);
}

unsafe extern "system" fn gen_framebuffers(n: GLsizei, out: *mut GLuint) {
    record("glGenFramebuffers");
    gen_names(n, out, |state| &mut state.framebuffers);
}

unsafe extern "system" fn gen_textures(n: GLsizei, out: *mut GLuint) {
    record("glGenTextures");
    gen_names(n, out, |state| &mut state.textures);
}

/// Not recorded: error checks run after every call in debug builds and would
/// drown the call log.
unsafe extern "system" fn get_error() -> GLenum {
    with_state(|state| state.errors.pop_front().unwrap_or(gl::NO_ERROR))
}

unsafe extern "system" fn get_program_info_log(
    _program: GLuint,
    buf_size: GLsizei,
    length: *mut GLsizei,
    out: *mut GLchar,
) {
    record("glGetProgramInfoLog");
    let log = with_state(|state| state.info_log.clone());
    write_log(&log, buf_size, length, out);
}

unsafe extern "system" fn get_programiv(_program: GLuint, pname: GLenum, params: *mut GLint) {
    record("glGetProgramiv");
    with_state(|state| {
        *params = match pname {
            gl::LINK_STATUS => state.link_ok as GLint,
            gl::INFO_LOG_LENGTH => log_length(state),
            _ => 0,
        };
    });
}

unsafe extern "system" fn get_shader_info_log(
    _shader: GLuint,
    buf_size: GLsizei,
    length: *mut GLsizei,
    out: *mut GLchar,
) {
    record("glGetShaderInfoLog");
    let log = with_state(|state| state.info_log.clone());
    write_log(&log, buf_size, length, out);
}

unsafe extern "system" fn get_shaderiv(_shader: GLuint, pname: GLenum, params: *mut GLint) {
    record("glGetShaderiv");
    with_state(|state| {
        *params = match pname {
            gl::COMPILE_STATUS => state.compile_ok as GLint,
            gl::INFO_LOG_LENGTH => log_length(state),
            _ => 0,
        };
    });
}

unsafe extern "system" fn get_uniform_location(_program: GLuint, name: *const GLchar) -> GLint {
    record("glGetUniformLocation");
    let _ = CStr::from_ptr(name);
    with_state(|state| if state.missing_uniforms { -1 } else { 0 })
}

unsafe extern "system" fn import_memory_fd_ext(
    _memory: GLuint,
    _size: GLuint64,
    _handle_type: GLenum,
    fd: GLint,
) {
    record("glImportMemoryFdEXT");
    // A successful import transfers ownership of the descriptor to GL.
    #[cfg(unix)]
    if fd >= 0 {
        use std::os::fd::FromRawFd;
        drop(std::os::fd::OwnedFd::from_raw_fd(fd));
    }
    with_state(|state| state.imported_fds += 1);
}

fn lookup(name: &str) -> *const c_void {
    macro_rules! table {
        ($($symbol:literal => $function:expr,)*) => {
            match name {
                $( $symbol => $function as *const c_void, )*
                _ => std::ptr::null(),
            }
        };
    }

    table! {
        "glActiveTexture" => active_texture as unsafe extern "system" fn(_),
        "glAttachShader" => attach_shader as unsafe extern "system" fn(_, _),
        "glBindAttribLocation" => bind_attrib_location as unsafe extern "system" fn(_, _, _),
        "glBindBuffer" => bind_buffer as unsafe extern "system" fn(_, _),
        "glBindFramebuffer" => bind_framebuffer as unsafe extern "system" fn(_, _),
        "glBindTexture" => bind_texture as unsafe extern "system" fn(_, _),
        "glCheckFramebufferStatus" => check_framebuffer_status as unsafe extern "system" fn(_) -> _,
        "glClear" => clear as unsafe extern "system" fn(_),
        "glClearColor" => clear_color as unsafe extern "system" fn(_, _, _, _),
        "glColorMask" => color_mask as unsafe extern "system" fn(_, _, _, _),
        "glCompileShader" => compile_shader as unsafe extern "system" fn(_),
        "glCreateMemoryObjectsEXT" => create_memory_objects_ext as unsafe extern "system" fn(_, _),
        "glCreateProgram" => create_program as unsafe extern "system" fn() -> _,
        "glCreateShader" => create_shader as unsafe extern "system" fn(_) -> _,
        "glDeleteFramebuffers" => delete_framebuffers as unsafe extern "system" fn(_, _),
        "glDeleteMemoryObjectsEXT" => delete_memory_objects_ext as unsafe extern "system" fn(_, _),
        "glDeleteProgram" => delete_program as unsafe extern "system" fn(_),
        "glDeleteShader" => delete_shader as unsafe extern "system" fn(_),
        "glDeleteTextures" => delete_textures as unsafe extern "system" fn(_, _),
        "glDisable" => disable as unsafe extern "system" fn(_),
        "glDisableVertexAttribArray" => disable_vertex_attrib_array as unsafe extern "system" fn(_),
        "glDrawArrays" => draw_arrays as unsafe extern "system" fn(_, _, _),
        "glEnableVertexAttribArray" => enable_vertex_attrib_array as unsafe extern "system" fn(_),
        "glFinish" => finish as unsafe extern "system" fn(),
        "glFramebufferTexture2D" => framebuffer_texture_2d as unsafe extern "system" fn(_, _, _, _, _),
        "glGenFramebuffers" => gen_framebuffers as unsafe extern "system" fn(_, _),
        "glGenTextures" => gen_textures as unsafe extern "system" fn(_, _),
        "glGetError" => get_error as unsafe extern "system" fn() -> _,
        "glGetProgramInfoLog" => get_program_info_log as unsafe extern "system" fn(_, _, _, _),
        "glGetProgramiv" => get_programiv as unsafe extern "system" fn(_, _, _),
        "glGetShaderInfoLog" => get_shader_info_log as unsafe extern "system" fn(_, _, _, _),
        "glGetShaderiv" => get_shaderiv as unsafe extern "system" fn(_, _, _),
        "glGetUniformLocation" => get_uniform_location as unsafe extern "system" fn(_, _) -> _,
        "glImportMemoryFdEXT" => import_memory_fd_ext as unsafe extern "system" fn(_, _, _, _),
        "glLinkProgram" => link_program as unsafe extern "system" fn(_),
        "glShaderSource" => shader_source as unsafe extern "system" fn(_, _, _, _),
        "glTexParameteri" => tex_parameteri as unsafe extern "system" fn(_, _, _),
        "glTexStorageMem2DEXT" => tex_storage_mem_2d_ext as unsafe extern "system" fn(_, _, _, _, _, _, _),
        "glUniform1i" => uniform_1i as unsafe extern "system" fn(_, _),
        "glUseProgram" => use_program as unsafe extern "system" fn(_),
        "glVertexAttribPointer" => vertex_attrib_pointer as unsafe extern "system" fn(_, _, _, _, _, _),
        "glViewport" => viewport as unsafe extern "system" fn(_, _, _, _),
        "glObjectLabelKHR" => object_label_khr as unsafe extern "system" fn(_, _, _, _),
        "glPopDebugGroupKHR" => pop_debug_group_khr as unsafe extern "system" fn(),
        "glPushDebugGroupKHR" => push_debug_group_khr as unsafe extern "system" fn(_, _, _, _),
    }
}

/// Handle to the calling thread's fake driver.
///
/// Not `Send`: the driver state it inspects belongs to the installing thread.
pub struct MockGl {
    _thread_bound: PhantomData<*const ()>,
}

impl MockGl {
    /// Reset this thread's driver to a clean state and return a handle to it.
    pub fn install() -> Self {
        with_state(|state| *state = MockState::default());
        Self {
            _thread_bound: PhantomData,
        }
    }

    /// Resolver that knows every symbol the fake driver implements.
    pub fn resolver(&self) -> impl Fn(&str) -> *const c_void + 'static {
        lookup
    }

    /// Resolver that reports `missing` as unexported.
    pub fn resolver_without(
        &self,
        missing: &[&'static str],
    ) -> impl Fn(&str) -> *const c_void + 'static {
        let missing = missing.to_vec();
        move |name: &str| {
            if missing.iter().any(|symbol| *symbol == name) {
                std::ptr::null()
            } else {
                lookup(name)
            }
        }
    }

    /// Every recorded call, in order. `glGetError` is not recorded.
    pub fn calls(&self) -> Vec<&'static str> {
        with_state(|state| state.calls.clone())
    }

    pub fn call_count(&self, name: &str) -> usize {
        with_state(|state| state.calls.iter().filter(|call| **call == name).count())
    }

    pub fn clear_calls(&self) {
        with_state(|state| state.calls.clear());
    }

    /// Queue an error for the next `glGetError` query.
    pub fn push_error(&self, error: GLenum) {
        with_state(|state| state.errors.push_back(error));
    }

    pub fn set_compile_status(&self, ok: bool) {
        with_state(|state| state.compile_ok = ok);
    }

    pub fn set_link_status(&self, ok: bool) {
        with_state(|state| state.link_ok = ok);
    }

    /// Info log returned for both shaders and programs.
    pub fn set_info_log(&self, log: &str) {
        with_state(|state| state.info_log = log.to_owned());
    }

    /// Make `glGetUniformLocation` report every uniform as inactive.
    pub fn set_missing_uniforms(&self, missing: bool) {
        with_state(|state| state.missing_uniforms = missing);
    }

    pub fn set_framebuffer_status(&self, status: GLenum) {
        with_state(|state| state.framebuffer_status = status);
    }

    pub fn live_textures(&self) -> usize {
        with_state(|state| state.textures.len())
    }

    pub fn live_framebuffers(&self) -> usize {
        with_state(|state| state.framebuffers.len())
    }

    pub fn live_memory_objects(&self) -> usize {
        with_state(|state| state.memory_objects.len())
    }

    pub fn live_programs(&self) -> usize {
        with_state(|state| state.programs.len())
    }

    pub fn live_shaders(&self) -> usize {
        with_state(|state| state.shaders.len())
    }

    pub fn imported_fds(&self) -> usize {
        with_state(|state| state.imported_fds)
    }
}
