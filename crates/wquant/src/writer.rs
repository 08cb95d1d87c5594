//! C source writer.
//!
//! Produces a header/source pair. Arrays become `const` tables tagged with
//! `WEIGHTS_<name>_DEFINED` / `WEIGHTS_<name>_TYPE` macros so that the array
//! table emitted at session end can reference them.
//!
//! ```text
//! #ifndef USE_WEIGHTS_FILE                 (blob mode)
//! #ifndef DISABLE_DEBUG_FLOAT              (float shadow of int8 weights)
//! #define WEIGHTS_fc_weights_float_DEFINED
//! #define WEIGHTS_fc_weights_float_TYPE WEIGHT_TYPE_float
//! static const float fc_weights_float[16] = {
//!     0.1, 0.2, ...
//! };
//! #endif /*DISABLE_DEBUG_FLOAT*/
//! #endif /* USE_WEIGHTS_FILE */
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::debug;
use wquant_core::{Error, Result};

use crate::config::WriterConfig;
use crate::sink::{ArrayOptions, NamedArray, WeightSink};

const GENERATED_NOTICE: &str = "/* Auto generated weight tables. Do not edit. */";

/// Writes generated C into a header stream and a source stream.
#[derive(Debug)]
pub struct CWriter<W: Write> {
    header: W,
    source: W,
    config: WriterConfig,
    guard: String,
}

impl CWriter<BufWriter<File>> {
    /// Create `<basename>.h` and `<basename>.c`.
    pub fn create(basename: impl AsRef<Path>, config: WriterConfig) -> Result<Self> {
        let basename = basename.as_ref();
        let stem = basename
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Config(format!("invalid output basename {}", basename.display())))?
            .to_string();

        let header = BufWriter::new(File::create(basename.with_file_name(format!("{stem}.h")))?);
        let source = BufWriter::new(File::create(basename.with_file_name(format!("{stem}.c")))?);
        Self::new(header, source, &stem, config)
    }
}

impl<W: Write> CWriter<W> {
    /// Wrap two streams and write the file preambles.
    ///
    /// `stem` names the pair (`<stem>.h` is included from the source) and
    /// derives the include guard.
    pub fn new(mut header: W, mut source: W, stem: &str, config: WriterConfig) -> Result<Self> {
        let guard = format!("{}_H", sanitize_identifier(stem).to_uppercase());

        if let Some(message) = &config.message {
            writeln!(header, "/* {message} */")?;
            writeln!(source, "/* {message} */")?;
        }
        writeln!(header, "{GENERATED_NOTICE}\n")?;
        writeln!(source, "{GENERATED_NOTICE}\n")?;

        write!(
            header,
            "#ifndef {guard}\n#define {guard}\n\n#include \"{}\"\n",
            config.nnet_header
        )?;
        write!(
            source,
            "#ifdef HAVE_CONFIG_H\n#include \"config.h\"\n#endif\n\n#include \"{}\"\n#include \"{stem}.h\"\n",
            config.nnet_header
        )?;

        debug!(stem, binary_blob = config.binary_blob, "opened C writer");
        Ok(Self {
            header,
            source,
            config,
            guard,
        })
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Close the include guard, flush, and hand back both streams.
    pub fn close(mut self) -> Result<(W, W)> {
        write!(self.header, "\n#endif /* {} */\n", self.guard)?;
        self.header.flush()?;
        self.source.flush()?;
        Ok((self.header, self.source))
    }
}

impl<W: Write> WeightSink for CWriter<W> {
    fn binary_blob(&self) -> bool {
        self.config.binary_blob
    }

    fn write_array(&mut self, array: &NamedArray, options: ArrayOptions) -> Result<()> {
        let name = &array.name;
        let f = &mut self.source;

        if let Some(cond) = options.condition {
            let directive = if cond.defined { "#ifdef" } else { "#ifndef" };
            writeln!(f, "{directive} {}", cond.symbol)?;
        }
        if self.config.binary_blob {
            write!(f, "\n#ifndef USE_WEIGHTS_FILE\n")?;
        }
        if options.debug_float {
            writeln!(f, "#ifndef DISABLE_DEBUG_FLOAT")?;
        }

        write!(
            f,
            "\n#define WEIGHTS_{name}_DEFINED\n#define WEIGHTS_{name}_TYPE WEIGHT_TYPE_{}\n",
            array.dtype().tag()
        )?;
        if options.is_static {
            write!(f, "static ")?;
        }
        write!(
            f,
            "const {} {name}[{}] = {{\n    {}\n}};\n\n",
            array.dtype().c_type(),
            array.len(),
            array.c_values()
        )?;

        if options.debug_float {
            writeln!(f, "#endif /*DISABLE_DEBUG_FLOAT*/")?;
        }
        if self.config.binary_blob {
            write!(f, "\n#endif /* USE_WEIGHTS_FILE */\n")?;
        }
        if let Some(cond) = options.condition {
            writeln!(f, "#endif /*{}*/", cond.symbol)?;
        }
        Ok(())
    }

    fn write_header(&mut self, text: &str) -> Result<()> {
        self.header.write_all(text.as_bytes())?;
        Ok(())
    }

    fn write_source(&mut self, text: &str) -> Result<()> {
        self.source.write_all(text.as_bytes())?;
        Ok(())
    }
}

/// Replace every character that cannot appear in a C identifier.
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Condition;

    fn writer(binary_blob: bool) -> CWriter<Vec<u8>> {
        let config = WriterConfig {
            binary_blob,
            ..WriterConfig::default()
        };
        CWriter::new(Vec::new(), Vec::new(), "model_data", config).unwrap()
    }

    fn close(w: CWriter<Vec<u8>>) -> (String, String) {
        let (h, s) = w.close().unwrap();
        (String::from_utf8(h).unwrap(), String::from_utf8(s).unwrap())
    }

    #[test]
    fn test_preambles_and_guard() {
        let (h, s) = close(writer(true));
        assert!(h.contains("#ifndef MODEL_DATA_H\n#define MODEL_DATA_H"));
        assert!(h.contains("#include \"nnet.h\""));
        assert!(h.trim_end().ends_with("#endif /* MODEL_DATA_H */"));
        assert!(s.contains("#include \"model_data.h\""));
    }

    #[test]
    fn test_direct_mode_array() {
        let mut w = writer(false);
        w.write_array(&NamedArray::int8("fc_weights_int8", vec![1, -2, 3]), ArrayOptions::default())
            .unwrap();
        let (_, s) = close(w);
        assert!(s.contains("#define WEIGHTS_fc_weights_int8_DEFINED\n"));
        assert!(s.contains("#define WEIGHTS_fc_weights_int8_TYPE WEIGHT_TYPE_int8\n"));
        assert!(s.contains("static const opus_int8 fc_weights_int8[3] = {\n    1, -2, 3\n};\n"));
        assert!(!s.contains("USE_WEIGHTS_FILE"));
    }

    #[test]
    fn test_blob_mode_guards() {
        let mut w = writer(true);
        w.write_array(&NamedArray::float("fc_weights_float", vec![0.5]), ArrayOptions::debug_float(true))
            .unwrap();
        let (_, s) = close(w);
        let blob = s.find("#ifndef USE_WEIGHTS_FILE").unwrap();
        let debug = s.find("#ifndef DISABLE_DEBUG_FLOAT").unwrap();
        let end_debug = s.find("#endif /*DISABLE_DEBUG_FLOAT*/").unwrap();
        let end_blob = s.find("#endif /* USE_WEIGHTS_FILE */").unwrap();
        assert!(blob < debug && debug < end_debug && end_debug < end_blob);
    }

    #[test]
    fn test_conditional_array() {
        let mut w = writer(false);
        w.write_array(
            &NamedArray::qweight("gru_weights", vec![0; 2]),
            ArrayOptions::when(Condition::ifdef("DOT_PROD")),
        )
        .unwrap();
        let (_, s) = close(w);
        assert!(s.contains("#ifdef DOT_PROD\n"));
        assert!(s.contains("const qweight gru_weights[2]"));
        assert!(s.contains("#endif /*DOT_PROD*/\n"));
    }

    #[test]
    fn test_create_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("tiny_model");
        let mut w = CWriter::create(&base, WriterConfig::default()).unwrap();
        w.write_header("\n#define TINY 1\n").unwrap();
        w.close().unwrap();

        let h = std::fs::read_to_string(dir.path().join("tiny_model.h")).unwrap();
        assert!(h.contains("#define TINY 1"));
        assert!(dir.path().join("tiny_model.c").exists());
    }

    #[test]
    fn test_create_keeps_dotted_basename() {
        let dir = tempfile::tempdir().unwrap();
        let w = CWriter::create(dir.path().join("model.v2"), WriterConfig::default()).unwrap();
        w.close().unwrap();

        assert!(dir.path().join("model.v2.h").exists());
        assert!(dir.path().join("model.v2.c").exists());
        assert!(!dir.path().join("model.h").exists());
        let s = std::fs::read_to_string(dir.path().join("model.v2.c")).unwrap();
        assert!(s.contains("#include \"model.v2.h\""));
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("lpc-net.v2"), "lpc_net_v2");
    }
}
