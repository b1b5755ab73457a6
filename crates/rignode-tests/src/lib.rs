//! Integration tests for the rignode agent live in `tests/`.
