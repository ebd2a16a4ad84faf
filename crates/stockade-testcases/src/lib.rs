//! Programs run inside the sandbox by the end-to-end tests in `tests/`.
//! Each lives in `src/bin/` and is located with `CARGO_BIN_EXE_<name>`.
