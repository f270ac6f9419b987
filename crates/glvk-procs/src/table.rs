//! The fixed set of GL entry points used by the GL-Vulkan bridge.
//!
//! The list covers the conversion program (shader compile/link, a textured
//! quad draw), framebuffer setup, and `GL_EXT_memory_object_fd` import of
//! Vulkan-exported memory.
//!
//! - <https://registry.khronos.org/OpenGL/extensions/EXT/EXT_external_objects.txt>
//! - <https://registry.khronos.org/OpenGL/extensions/EXT/EXT_external_objects_fd.txt>

#![allow(clippy::type_complexity)]

use std::ffi::c_void;
use std::sync::Arc;
use std::thread::ThreadId;

use once_cell::sync::OnceCell;

use tracing::debug;

use crate::ffi::*;
use crate::proc::{GlProc, GlProcBase, ProcDebugOptions};

macro_rules! proc_table {
    (
        required {
            $( $field:ident => $symbol:literal : fn($($arg:ty),*) $(-> $ret:ty)?; )*
        }
        optional {
            $( $opt_field:ident => $opt_symbol:literal : fn($($opt_arg:ty),*) $(-> $opt_ret:ty)?; )*
        }
    ) => {
        /// Resolved GL entry points, one [`GlProc`] per symbol.
        ///
        /// Built once per bridging context with the context current, and
        /// dropped with it. The set of names is fixed; only the resolution
        /// state varies between drivers.
        pub struct ProcTable {
            $( pub $field: GlProc<unsafe extern "system" fn($($arg),*) $(-> $ret)?>, )*
            $( pub $opt_field: GlProc<unsafe extern "system" fn($($opt_arg),*) $(-> $opt_ret)?>, )*
            is_valid: bool,
            /// First thread to call through any entry, shared by all of them.
            render_thread: Arc<OnceCell<ThreadId>>,
        }

        impl ProcTable {
            /// Symbols that must resolve for the table to be valid.
            pub const REQUIRED: &'static [&'static str] = &[$($symbol),*];

            /// Symbols whose absence is tolerated.
            pub const OPTIONAL: &'static [&'static str] = &[$($opt_symbol),*];

            /// Resolve every entry exactly once through `resolver`.
            ///
            /// `resolver` maps a symbol name to its address, or null when the
            /// driver does not export it.
            pub fn new(resolver: &ResolverFn<'_>, options: ProcDebugOptions) -> Self {
                let error_fn = {
                    let address = resolver("glGetError");
                    if address.is_null() {
                        None
                    } else {
                        // SAFETY: the resolver returns the address of `glGetError`,
                        // whose ABI is `GLenum glGetError(void)`.
                        Some(unsafe { std::mem::transmute::<*const c_void, PfnGlGetError>(address) })
                    }
                };

                let render_thread = Arc::new(OnceCell::new());
                let mut table = Self {
                    $(
                        $field: {
                            let address = resolver($symbol);
                            let function = if address.is_null() {
                                None
                            } else {
                                // SAFETY: the resolver returns the address of the named
                                // GL symbol, whose signature is spelled out in the list.
                                Some(unsafe {
                                    std::mem::transmute::<
                                        *const c_void,
                                        unsafe extern "system" fn($($arg),*) $(-> $ret)?,
                                    >(address)
                                })
                            };
                            GlProc::new($symbol, function, error_fn, Arc::clone(&render_thread))
                        },
                    )*
                    $(
                        $opt_field: {
                            let address = resolver($opt_symbol);
                            let function = if address.is_null() {
                                None
                            } else {
                                // SAFETY: as above.
                                Some(unsafe {
                                    std::mem::transmute::<
                                        *const c_void,
                                        unsafe extern "system" fn($($opt_arg),*) $(-> $opt_ret)?,
                                    >(address)
                                })
                            };
                            GlProc::new($opt_symbol, function, error_fn, Arc::clone(&render_thread))
                        },
                    )*
                    is_valid: false,
                    render_thread,
                };

                for entry in table.entries() {
                    entry.apply(options);
                }
                table.is_valid = table.missing_required().is_empty();

                debug!(
                    valid = table.is_valid,
                    optional_resolved = table.optional_resolved(),
                    "Resolved GL proc table"
                );

                table
            }

            /// Required symbols that did not resolve.
            pub fn missing_required(&self) -> Vec<&'static str> {
                let mut missing = Vec::new();
                $(
                    if !self.$field.is_available() {
                        missing.push($symbol);
                    }
                )*
                missing
            }

            fn optional_resolved(&self) -> usize {
                let mut resolved = 0;
                $(
                    if self.$opt_field.is_available() {
                        resolved += 1;
                    }
                )*
                resolved
            }

            /// Diagnostic state of every entry, required first.
            pub fn entries(&self) -> Vec<&GlProcBase> {
                vec![
                    $( self.$field.base(), )*
                    $( self.$opt_field.base(), )*
                ]
            }
        }
    };
}

proc_table! {
    required {
        active_texture => "glActiveTexture": fn(GLenum);
        attach_shader => "glAttachShader": fn(GLuint, GLuint);
        bind_attrib_location => "glBindAttribLocation": fn(GLuint, GLuint, *const GLchar);
        bind_buffer => "glBindBuffer": fn(GLenum, GLuint);
        bind_framebuffer => "glBindFramebuffer": fn(GLenum, GLuint);
        bind_texture => "glBindTexture": fn(GLenum, GLuint);
        check_framebuffer_status => "glCheckFramebufferStatus": fn(GLenum) -> GLenum;
        clear => "glClear": fn(GLbitfield);
        clear_color => "glClearColor": fn(GLfloat, GLfloat, GLfloat, GLfloat);
        color_mask => "glColorMask": fn(GLboolean, GLboolean, GLboolean, GLboolean);
        compile_shader => "glCompileShader": fn(GLuint);
        create_memory_objects_ext => "glCreateMemoryObjectsEXT": fn(GLsizei, *mut GLuint);
        create_program => "glCreateProgram": fn() -> GLuint;
        create_shader => "glCreateShader": fn(GLenum) -> GLuint;
        delete_framebuffers => "glDeleteFramebuffers": fn(GLsizei, *const GLuint);
        delete_memory_objects_ext => "glDeleteMemoryObjectsEXT": fn(GLsizei, *const GLuint);
        delete_program => "glDeleteProgram": fn(GLuint);
        delete_shader => "glDeleteShader": fn(GLuint);
        delete_textures => "glDeleteTextures": fn(GLsizei, *const GLuint);
        disable => "glDisable": fn(GLenum);
        disable_vertex_attrib_array => "glDisableVertexAttribArray": fn(GLuint);
        draw_arrays => "glDrawArrays": fn(GLenum, GLint, GLsizei);
        enable_vertex_attrib_array => "glEnableVertexAttribArray": fn(GLuint);
        finish => "glFinish": fn();
        framebuffer_texture_2d => "glFramebufferTexture2D": fn(GLenum, GLenum, GLenum, GLuint, GLint);
        gen_framebuffers => "glGenFramebuffers": fn(GLsizei, *mut GLuint);
        gen_textures => "glGenTextures": fn(GLsizei, *mut GLuint);
        get_error => "glGetError": fn() -> GLenum;
        get_program_info_log => "glGetProgramInfoLog": fn(GLuint, GLsizei, *mut GLsizei, *mut GLchar);
        get_programiv => "glGetProgramiv": fn(GLuint, GLenum, *mut GLint);
        get_shader_info_log => "glGetShaderInfoLog": fn(GLuint, GLsizei, *mut GLsizei, *mut GLchar);
        get_shaderiv => "glGetShaderiv": fn(GLuint, GLenum, *mut GLint);
        get_uniform_location => "glGetUniformLocation": fn(GLuint, *const GLchar) -> GLint;
        import_memory_fd_ext => "glImportMemoryFdEXT": fn(GLuint, GLuint64, GLenum, GLint);
        link_program => "glLinkProgram": fn(GLuint);
        shader_source => "glShaderSource": fn(GLuint, GLsizei, *const *const GLchar, *const GLint);
        tex_parameteri => "glTexParameteri": fn(GLenum, GLenum, GLint);
        tex_storage_mem_2d_ext => "glTexStorageMem2DEXT": fn(GLenum, GLsizei, GLenum, GLsizei, GLsizei, GLuint, GLuint64);
        uniform_1i => "glUniform1i": fn(GLint, GLint);
        use_program => "glUseProgram": fn(GLuint);
        vertex_attrib_pointer => "glVertexAttribPointer": fn(GLuint, GLint, GLenum, GLboolean, GLsizei, *const c_void);
        viewport => "glViewport": fn(GLint, GLint, GLsizei, GLsizei);
    }
    optional {
        object_label_khr => "glObjectLabelKHR": fn(GLenum, GLuint, GLsizei, *const GLchar);
        pop_debug_group_khr => "glPopDebugGroupKHR": fn();
        push_debug_group_khr => "glPushDebugGroupKHR": fn(GLenum, GLuint, GLsizei, *const GLchar);
    }
}

impl ProcTable {
    /// True only if every required entry point resolved.
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    /// The thread that made the first call through this table, once one has
    /// been made with thread enforcement on.
    pub fn render_thread(&self) -> Option<ThreadId> {
        self.render_thread.get().copied()
    }

    /// Toggle per-call logging on every entry point.
    pub fn set_debug_call_logging(&self, log: bool) {
        for entry in self.entries() {
            entry.set_log_calls(log);
        }
    }

    /// Toggle per-call logging on one entry point. Returns false if no entry
    /// has that name.
    pub fn set_debug_call_logging_for(&self, log: bool, function_name: &str) -> bool {
        self.with_entry(function_name, |entry| entry.set_log_calls(log))
    }

    /// Toggle the post-call `glGetError` query on every entry point.
    pub fn set_debug_error_checking(&self, check: bool) {
        for entry in self.entries() {
            entry.set_error_checking(check);
        }
    }

    /// Toggle the post-call `glGetError` query on one entry point. Returns
    /// false if no entry has that name.
    pub fn set_debug_error_checking_for(&self, check: bool, function_name: &str) -> bool {
        self.with_entry(function_name, |entry| entry.set_error_checking(check))
    }

    fn with_entry(&self, function_name: &str, f: impl FnOnce(&GlProcBase)) -> bool {
        match self
            .entries()
            .into_iter()
            .find(|entry| entry.name() == function_name)
        {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Wrap subsequent calls in a named debug group, if `GL_KHR_debug` is
    /// available. Pair with [`ProcTable::pop_debug_group`].
    pub fn push_debug_group(&self, label: &str) {
        if !self.push_debug_group_khr.is_available() {
            return;
        }
        let length = label.len().min(GLsizei::MAX as usize) as GLsizei;
        unsafe {
            self.push_debug_group_khr.call(|f| {
                f(
                    GL_DEBUG_SOURCE_APPLICATION_KHR,
                    0,
                    length,
                    label.as_ptr().cast(),
                )
            })
        };
    }

    pub fn pop_debug_group(&self) {
        if self.pop_debug_group_khr.is_available() {
            unsafe { self.pop_debug_group_khr.call(|f| f()) };
        }
    }

    /// Attach a debug label to a texture name, if `GL_KHR_debug` is available.
    pub fn set_texture_label(&self, texture: GLuint, label: &str) -> bool {
        if !self.object_label_khr.is_available() {
            return false;
        }
        let length = label.len().min(GLsizei::MAX as usize) as GLsizei;
        unsafe {
            self.object_label_khr
                .call(|f| f(GL_TEXTURE_KHR, texture, length, label.as_ptr().cast()))
        };
        true
    }
}

impl std::fmt::Debug for ProcTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcTable")
            .field("is_valid", &self.is_valid)
            .field("missing_required", &self.missing_required())
            .finish()
    }
}
