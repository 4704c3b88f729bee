mod hasher;
mod walker;
