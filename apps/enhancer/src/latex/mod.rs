// LaTeX rendering: detect compilable markup in model output, then compile it in
// an isolated scratch directory. The compiler runs out of process.

pub mod compiler;
pub mod detect;
pub mod handlers;
pub mod pipeline;

pub use compiler::TexCompiler;
pub use detect::{extract_latex_content, is_latex_content};
pub use pipeline::CompilationPipeline;
