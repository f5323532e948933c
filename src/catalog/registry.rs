//! Curated model table

use super::types::ModelDescriptor;

/// Id of the model shipped inside the app bundle
pub const BUNDLED_MODEL_ID: &str = "qwen2.5-0.5b-instruct";

/// Known models: the bundled fallback plus curated downloads
pub fn known_models() -> Vec<ModelDescriptor> {
    // Curated list of small instruction-tuned GGUF models that run on phones
    // and laptops. Ids of remote entries are derived from (repo, file) so a
    // remote search for the same file lands on the same descriptor.
    vec![
        ModelDescriptor::bundled(
            BUNDLED_MODEL_ID,
            "Qwen 2.5 0.5B Instruct",
            "qwen2.5-0.5b-instruct-q4_k_m.gguf",
            491_400_032, // ~0.5 GB
        )
        .with_description("Tiny bundled model, always available offline."),
        ModelDescriptor::remote(
            "bartowski/Llama-3.2-1B-Instruct-GGUF",
            "Llama-3.2-1B-Instruct-Q4_K_M.gguf",
            "Llama 3.2 1B Instruct",
            807_694_464, // ~0.8 GB
        )
        .with_description("Smallest Llama model, fast and lightweight."),
        ModelDescriptor::remote(
            "Qwen/Qwen2.5-1.5B-Instruct-GGUF",
            "qwen2.5-1.5b-instruct-q4_k_m.gguf",
            "Qwen 2.5 1.5B Instruct",
            1_117_320_736, // ~1.1 GB
        )
        .with_description("Good balance of speed and quality, strong multilingual support."),
        ModelDescriptor::remote(
            "bartowski/Llama-3.2-3B-Instruct-GGUF",
            "Llama-3.2-3B-Instruct-Q4_K_M.gguf",
            "Llama 3.2 3B Instruct",
            2_019_377_696, // ~2 GB
        )
        .with_description("Meta's small model, great for chat."),
        ModelDescriptor::remote(
            "bartowski/Phi-3.5-mini-instruct-GGUF",
            "Phi-3.5-mini-instruct-Q4_K_M.gguf",
            "Phi 3.5 Mini",
            2_393_232_384, // ~2.4 GB
        )
        .with_description("Microsoft's efficient small model."),
        ModelDescriptor::remote(
            "bartowski/Mistral-7B-Instruct-v0.3-GGUF",
            "Mistral-7B-Instruct-v0.3-Q4_K_M.gguf",
            "Mistral 7B Instruct",
            4_372_812_000, // ~4.4 GB
        )
        .with_description("High-quality 7B model, needs a high-memory device."),
    ]
}
